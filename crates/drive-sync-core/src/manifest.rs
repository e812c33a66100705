//! Shared encrypted manifest exchange.
//!
//! The manifest is the single remote object through which replicas learn each
//! other's file records. Wire layout:
//!
//! ```text
//! [salt: 16 bytes, plaintext][nonce: 12 bytes][AES-GCM ciphertext of JSON]
//! ```
//!
//! The salt is left readable so a replica can adopt the group's salt (and
//! re-derive its key) before it attempts to decrypt anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError, KeyRing, Salt, SALT_LEN};
use crate::metadata::{now_millis, FileRecord};
use crate::profile::Profile;
use crate::remote::{calculate_backoff, RemoteError, RemoteStore, RetryConfig};

/// Well-known remote name (and reserved meta-path) of the manifest.
pub const MANIFEST_FILE_NAME: &str = ".drive-sync-manifest";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest too short: {0} bytes")]
    Truncated(usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Manifest not visible after {attempts} listing attempts")]
    Bootstrap { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Decrypted manifest contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub last_sync: u64,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    pub encryption_salt: String,
    #[serde(default)]
    pub drive_folder_id: String,
}

impl Manifest {
    /// Manifest published when no peer has synced yet.
    pub fn bootstrap(salt: Salt, folder_id: &str) -> Self {
        Self {
            last_sync: 0,
            files: BTreeMap::new(),
            encryption_salt: salt.to_hex(),
            drive_folder_id: folder_id.to_string(),
        }
    }

    /// Manifest carrying `files`, ready for publishing.
    pub fn publish(files: BTreeMap<String, FileRecord>, salt: Salt, folder_id: &str, now: u64) -> Self {
        Self {
            last_sync: now,
            files,
            encryption_salt: salt.to_hex(),
            drive_folder_id: folder_id.to_string(),
        }
    }
}

/// Records to publish: the fetched remote records, overridden by this
/// replica's own record for every path its profile syncs.
///
/// Paths outside the profile (such as an excluded config dir) keep the peer's
/// record. Live local records that were never uploaded replace nothing.
pub fn merge_records(
    remote: &BTreeMap<String, FileRecord>,
    local: &BTreeMap<String, FileRecord>,
    profile: &Profile,
) -> BTreeMap<String, FileRecord> {
    let mut files: BTreeMap<String, FileRecord> = remote
        .iter()
        .filter(|(path, _)| !Profile::is_manifest_path(path))
        .map(|(path, record)| (path.clone(), record.clone()))
        .collect();

    for (path, record) in local {
        if Profile::is_manifest_path(path) || !profile.syncs_path(path) {
            continue;
        }
        if !record.is_tombstoned() && record.content_hash.is_none() {
            continue;
        }
        files.insert(path.clone(), record.clone());
    }
    files
}

/// Salt prefix of an encoded manifest, readable without the password.
pub fn read_salt(bytes: &[u8]) -> Result<Salt> {
    if bytes.len() < SALT_LEN {
        return Err(ManifestError::Truncated(bytes.len()));
    }
    Ok(Salt::from_bytes(&bytes[..SALT_LEN])?)
}

/// Serialize, encrypt and salt-prefix a manifest.
pub fn encode_manifest(manifest: &Manifest, keys: &KeyRing) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(manifest).map_err(|e| ManifestError::Serialization(e.to_string()))?;
    let encrypted = crypto::encrypt_content(&json, keys.key())?;

    let mut out = Vec::with_capacity(SALT_LEN + encrypted.len());
    out.extend_from_slice(keys.salt().as_bytes());
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Decrypt a manifest. The caller must already have adopted its salt.
pub fn decode_manifest(bytes: &[u8], keys: &KeyRing) -> Result<Manifest> {
    if bytes.len() < SALT_LEN {
        return Err(ManifestError::Truncated(bytes.len()));
    }
    let json = crypto::decrypt_content(&bytes[SALT_LEN..], keys.key())?;
    serde_json::from_slice(&json).map_err(|e| ManifestError::Serialization(e.to_string()))
}

/// Remote manifest state for one sync.
#[derive(Debug, Clone)]
pub struct ManifestSession {
    pub folder_id: String,
    /// Remote id of the manifest object, once known
    pub manifest_id: Option<String>,
    pub manifest: Manifest,
    /// No peer had published a manifest before this sync
    pub bootstrapped: bool,
    /// The local salt was replaced by the manifest's
    pub salt_adopted: bool,
}

/// Locates, bootstraps and publishes the manifest in one remote folder.
pub struct ManifestExchange<'a, R: RemoteStore + ?Sized> {
    remote: &'a R,
    folder_name: &'a str,
    retry: &'a RetryConfig,
}

impl<'a, R: RemoteStore + ?Sized> ManifestExchange<'a, R> {
    pub fn new(remote: &'a R, folder_name: &'a str, retry: &'a RetryConfig) -> Self {
        Self {
            remote,
            folder_name,
            retry,
        }
    }

    /// Fetch the manifest, or publish a bootstrap one if none exists.
    ///
    /// Adopts the remote salt into `keys` before decrypting.
    pub async fn open(&self, keys: &mut KeyRing) -> Result<ManifestSession> {
        let folder_id = self.remote.find_or_create_folder(self.folder_name).await?;
        debug!("Using remote folder {} ({})", self.folder_name, folder_id);

        match self.find_manifest(&folder_id).await? {
            Some(manifest_id) => {
                let bytes = self.remote.download_file(&manifest_id).await?;
                let salt = read_salt(&bytes)?;
                let salt_adopted = keys.adopt_salt(salt);
                if salt_adopted {
                    info!("Adopted encryption salt from remote manifest");
                }
                let manifest = decode_manifest(&bytes, keys)?;
                debug!("Fetched manifest with {} record(s)", manifest.files.len());

                Ok(ManifestSession {
                    folder_id,
                    manifest_id: Some(manifest_id),
                    manifest,
                    bootstrapped: false,
                    salt_adopted,
                })
            }
            None => {
                info!("No remote manifest found, bootstrapping");
                let manifest = Manifest::bootstrap(keys.salt(), &folder_id);
                let bytes = encode_manifest(&manifest, keys)?;
                self.remote
                    .upload_file(&folder_id, MANIFEST_FILE_NAME, &bytes)
                    .await?;
                let manifest_id = self.await_manifest(&folder_id).await?;

                Ok(ManifestSession {
                    folder_id,
                    manifest_id: Some(manifest_id),
                    manifest,
                    bootstrapped: true,
                    salt_adopted: false,
                })
            }
        }
    }

    /// Publish `files` as the new manifest. Returns the manifest's remote id.
    pub async fn finalize(
        &self,
        session: &ManifestSession,
        files: BTreeMap<String, FileRecord>,
        keys: &KeyRing,
    ) -> Result<String> {
        let manifest = Manifest::publish(files, keys.salt(), &session.folder_id, now_millis());
        let bytes = encode_manifest(&manifest, keys)?;

        let info = match &session.manifest_id {
            Some(id) => self.remote.update_file(id, &bytes).await?,
            None => {
                self.remote
                    .upload_file(&session.folder_id, MANIFEST_FILE_NAME, &bytes)
                    .await?
            }
        };
        debug!("Published manifest with {} record(s)", manifest.files.len());
        Ok(info.id)
    }

    async fn find_manifest(&self, folder_id: &str) -> Result<Option<String>> {
        let files = self.remote.list_files(folder_id).await?;
        Ok(files
            .into_iter()
            .find(|f| f.name == MANIFEST_FILE_NAME)
            .map(|f| f.id))
    }

    /// Re-list until the freshly uploaded manifest becomes visible.
    async fn await_manifest(&self, folder_id: &str) -> Result<String> {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(id) = self.find_manifest(folder_id).await? {
                return Ok(id);
            }
            if attempt < attempts {
                let delay = calculate_backoff(attempt, self.retry);
                warn!("Bootstrap manifest not listed yet, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
        Err(ManifestError::Bootstrap { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use crate::remote::InMemoryRemote;
    use std::time::Duration;

    const TEST_ROUNDS: u32 = 1_000;

    fn keys(password: &str, seed: u8) -> KeyRing {
        KeyRing::with_rounds(password, Salt::from_bytes(&[seed; SALT_LEN]).unwrap(), TEST_ROUNDS)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_factor: 2.0,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_wire_layout_has_plain_salt_prefix() {
        let keys = keys("pw", 9);
        let mut manifest = Manifest::bootstrap(keys.salt(), "folder-1");
        manifest.files.insert("a.md".into(), FileRecord::observed(1));

        let bytes = encode_manifest(&manifest, &keys).unwrap();
        assert_eq!(&bytes[..SALT_LEN], &[9u8; SALT_LEN]);
        assert_eq!(read_salt(&bytes).unwrap(), keys.salt());
        assert_eq!(decode_manifest(&bytes, &keys).unwrap(), manifest);
    }

    #[test]
    fn test_wrong_password_is_a_crypto_error() {
        let bytes = encode_manifest(&Manifest::bootstrap(keys("a", 1).salt(), "f"), &keys("a", 1)).unwrap();
        let result = decode_manifest(&bytes, &keys("b", 1));
        assert!(matches!(result, Err(ManifestError::Crypto(CryptoError::Decryption))));
        assert!(matches!(read_salt(&[0u8; 4]), Err(ManifestError::Truncated(4))));
    }

    #[tokio::test]
    async fn test_open_bootstraps_then_fetches() {
        let remote = InMemoryRemote::new();
        let retry = fast_retry();
        let exchange = ManifestExchange::new(&remote, "Vault Sync", &retry);

        let mut first = keys("pw", 1);
        let session = exchange.open(&mut first).await.unwrap();
        assert!(session.bootstrapped);
        assert!(session.manifest_id.is_some());
        assert_eq!(remote.object_names(&session.folder_id), vec![MANIFEST_FILE_NAME]);

        // Publish a record, then a second replica with its own salt opens it
        let mut store = MetadataStore::new();
        store.upsert("notes/a.md", FileRecord::observed(5));
        exchange
            .finalize(&session, store.files().clone(), &first)
            .await
            .unwrap();

        let mut second = keys("pw", 2);
        let fetched = exchange.open(&mut second).await.unwrap();
        assert!(!fetched.bootstrapped);
        assert!(fetched.salt_adopted);
        assert_eq!(second.salt(), first.salt());
        assert_eq!(fetched.manifest.files.len(), 1);
        assert_eq!(fetched.manifest_id, session.manifest_id);
    }

    #[tokio::test]
    async fn test_open_with_wrong_password_fails_after_salt_adoption() {
        let remote = InMemoryRemote::new();
        let retry = fast_retry();
        let exchange = ManifestExchange::new(&remote, "Vault Sync", &retry);

        exchange.open(&mut keys("right", 1)).await.unwrap();

        let mut wrong = keys("wrong", 2);
        let result = exchange.open(&mut wrong).await;
        assert!(matches!(result, Err(ManifestError::Crypto(CryptoError::Decryption))));
        assert_eq!(wrong.salt(), keys("right", 1).salt());
    }

    /// Store whose listings never show anything (eventually consistent worst case).
    struct BlindRemote(InMemoryRemote);

    #[async_trait::async_trait]
    impl RemoteStore for BlindRemote {
        async fn find_or_create_folder(&self, name: &str) -> crate::remote::Result<String> {
            self.0.find_or_create_folder(name).await
        }
        async fn list_files(&self, folder_id: &str) -> crate::remote::Result<Vec<crate::remote::RemoteFile>> {
            self.0.list_files(folder_id).await.map(|_| Vec::new())
        }
        async fn upload_file(&self, folder_id: &str, name: &str, content: &[u8]) -> crate::remote::Result<crate::remote::RemoteFile> {
            self.0.upload_file(folder_id, name, content).await
        }
        async fn update_file(&self, file_id: &str, content: &[u8]) -> crate::remote::Result<crate::remote::RemoteFile> {
            self.0.update_file(file_id, content).await
        }
        async fn download_file(&self, file_id: &str) -> crate::remote::Result<Vec<u8>> {
            self.0.download_file(file_id).await
        }
        async fn delete_file(&self, file_id: &str) -> crate::remote::Result<()> {
            self.0.delete_file(file_id).await
        }
    }

    #[tokio::test]
    async fn test_bootstrap_fails_when_manifest_never_appears() {
        let remote = BlindRemote(InMemoryRemote::new());
        let retry = fast_retry();
        let exchange = ManifestExchange::new(&remote, "Vault Sync", &retry);

        let result = exchange.open(&mut keys("pw", 1)).await;
        assert!(matches!(result, Err(ManifestError::Bootstrap { attempts: 3 })));
        // One listing to look for it, then three while waiting for it
        assert_eq!(remote.0.call_count("list_files"), 4);
    }

    fn uploaded(hash: &str, id: &str) -> FileRecord {
        let mut record = FileRecord::observed(1);
        record.mark_uploaded(hash.into(), id.into(), None);
        record
    }

    #[test]
    fn test_merge_keeps_records_this_replica_lacks() {
        let mut remote = BTreeMap::new();
        remote.insert("peer.md".to_string(), uploaded("p", "id-p"));
        remote.insert("shared.md".to_string(), uploaded("old", "id-s"));
        remote.insert(MANIFEST_FILE_NAME.to_string(), uploaded("m", "id-m"));

        let mut local = BTreeMap::new();
        local.insert("shared.md".to_string(), uploaded("new", "id-s"));
        local.insert("mine.md".to_string(), uploaded("m2", "id-m2"));

        let merged = merge_records(&remote, &local, &Profile::new("default"));
        assert_eq!(
            merged.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["mine.md", "peer.md", "shared.md"]
        );
        assert_eq!(merged["shared.md"].content_hash.as_deref(), Some("new"));
        assert_eq!(merged["peer.md"].drive_file_id.as_deref(), Some("id-p"));
    }

    #[test]
    fn test_merge_leaves_excluded_config_records_to_peers() {
        let mut remote = BTreeMap::new();
        remote.insert(".obsidian/app.json".to_string(), uploaded("cfg", "id-cfg"));

        let mut local = BTreeMap::new();
        local.insert(".obsidian/app.json".to_string(), FileRecord::observed(9));
        local.insert(".obsidian/hotkeys.json".to_string(), uploaded("hk", "id-hk"));

        let merged = merge_records(&remote, &local, &Profile::new("default"));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[".obsidian/app.json"].content_hash.as_deref(), Some("cfg"));

        // A profile that syncs the config dir publishes its own records
        let full = Profile::new("full").with_config_dir_included(true);
        let merged = merge_records(&remote, &local, &full);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[".obsidian/app.json"].content_hash.as_deref(), Some("cfg"));
        assert_eq!(merged[".obsidian/hotkeys.json"].content_hash.as_deref(), Some("hk"));
    }

    #[test]
    fn test_merge_never_publishes_unuploaded_live_records() {
        let remote = BTreeMap::new();
        let mut local = BTreeMap::new();
        local.insert("draft.md".to_string(), FileRecord::observed(3));
        let mut gone = FileRecord::observed(3);
        gone.tombstone(4);
        local.insert("gone.md".to_string(), gone);

        let merged = merge_records(&remote, &local, &Profile::new("default"));
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["gone.md"]);
    }
}
