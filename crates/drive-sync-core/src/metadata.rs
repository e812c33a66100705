//! Per-file sync records and the per-profile metadata store.
//!
//! Records are keyed by meta-path and are never removed: deletions become
//! tombstones so a replica can tell "deleted here" from "never seen here".
//! The store is persisted as JSON in the profile's state directory, the same
//! way the daemon persists its known peers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use web_time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{CryptoError, Salt};
use crate::fs::{FileSystem, FsError};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stored salt is invalid: {0}")]
    Salt(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sync state of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Plaintext hash as of the last successful upload or download
    #[serde(default)]
    pub content_hash: Option<String>,

    /// Local edit observed since the last sync (stored hash is stale)
    #[serde(default)]
    pub dirty: bool,

    /// Last local write was made by the engine itself
    #[serde(default)]
    pub just_downloaded: bool,

    /// Last observed local edit, ms since epoch
    #[serde(default)]
    pub last_modified: u64,

    #[serde(default)]
    pub deleted: bool,

    #[serde(default)]
    pub deleted_at: Option<u64>,

    /// Remote object id, set by the first successful upload
    #[serde(default)]
    pub drive_file_id: Option<String>,

    /// Encrypted name the remote object was created with
    #[serde(default)]
    pub obfuscated_name: Option<String>,
}

impl FileRecord {
    /// Record for a file first observed locally at `now`.
    pub fn observed(now: u64) -> Self {
        Self {
            content_hash: None,
            dirty: true,
            just_downloaded: false,
            last_modified: now,
            deleted: false,
            deleted_at: None,
            drive_file_id: None,
            obfuscated_name: None,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted
    }

    /// Hash of the content this record says exists. Tombstones have none.
    pub fn live_hash(&self) -> Option<&str> {
        if self.deleted {
            None
        } else {
            self.content_hash.as_deref()
        }
    }

    /// Local edit observed. Revives tombstoned records.
    pub fn mark_edited(&mut self, now: u64) {
        self.dirty = true;
        self.just_downloaded = false;
        self.last_modified = now;
        self.deleted = false;
        self.deleted_at = None;
    }

    pub fn tombstone(&mut self, now: u64) {
        self.deleted = true;
        self.deleted_at = Some(now);
    }

    pub fn mark_uploaded(&mut self, hash: String, file_id: String, obfuscated_name: Option<String>) {
        self.content_hash = Some(hash);
        self.dirty = false;
        self.drive_file_id = Some(file_id);
        if obfuscated_name.is_some() {
            self.obfuscated_name = obfuscated_name;
        }
        self.deleted = false;
        self.deleted_at = None;
    }

    /// Take hash and identity from the remote record after a download.
    ///
    /// `last_modified` stays the author's edit time, not the download time:
    /// this record is republished in the manifest, and a later stamp would
    /// outrank a peer's deletion of the same file.
    pub fn mark_downloaded(&mut self, remote: &FileRecord) {
        self.content_hash = remote.content_hash.clone();
        self.drive_file_id = remote.drive_file_id.clone();
        self.obfuscated_name = remote.obfuscated_name.clone();
        self.last_modified = remote.last_modified;
        self.dirty = false;
        self.just_downloaded = true;
        self.deleted = false;
        self.deleted_at = None;
    }
}

/// All sync state owned by one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataStore {
    /// Completion time of the last successful sync
    #[serde(default)]
    pub last_sync: Option<u64>,

    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,

    /// Hex-encoded key-derivation salt
    #[serde(default)]
    pub encryption_salt: Option<String>,

    #[serde(default)]
    pub drive_folder_id: Option<String>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store, returning an empty one if nothing was saved yet.
    pub async fn load<F: FileSystem + ?Sized>(fs: &F, path: &str) -> Result<Self> {
        if !fs.exists(path).await? {
            return Ok(Self::new());
        }
        let bytes = fs.read(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| MetadataError::Serialization(e.to_string()))
    }

    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F, path: &str) -> Result<()> {
        let contents = serde_json::to_vec_pretty(self)
            .map_err(|e| MetadataError::Serialization(e.to_string()))?;
        fs.write(path, &contents).await?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut FileRecord> {
        self.files.get_mut(path)
    }

    pub fn upsert(&mut self, path: impl Into<String>, record: FileRecord) {
        self.files.insert(path.into(), record);
    }

    /// Existing record for `path`, or a freshly observed one.
    pub fn record_mut_or_insert(&mut self, path: &str, now: u64) -> &mut FileRecord {
        self.files
            .entry(path.to_string())
            .or_insert_with(|| FileRecord::observed(now))
    }

    /// Tombstone a record. Unknown paths get a tombstone record too.
    pub fn tombstone(&mut self, path: &str, now: u64) {
        let record = self.record_mut_or_insert(path, now);
        record.tombstone(now);
    }

    pub fn files(&self) -> &BTreeMap<String, FileRecord> {
        &self.files
    }

    pub fn salt(&self) -> Result<Option<Salt>> {
        self.encryption_salt
            .as_deref()
            .map(Salt::from_hex)
            .transpose()
            .map_err(MetadataError::from)
    }

    pub fn set_salt(&mut self, salt: Salt) {
        self.encryption_salt = Some(salt.to_hex());
    }

    /// Forget every record and remote binding. The salt is kept.
    pub fn reset(&mut self) {
        self.files.clear();
        self.last_sync = None;
        self.drive_folder_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    #[test]
    fn test_record_lifecycle() {
        let mut record = FileRecord::observed(10);
        assert!(record.dirty);
        assert_eq!(record.content_hash, None);

        record.mark_uploaded("h1".into(), "id-1".into(), Some("x.enc".into()));
        assert!(!record.dirty);
        assert_eq!(record.drive_file_id.as_deref(), Some("id-1"));

        record.tombstone(20);
        assert!(record.is_tombstoned());
        assert_eq!(record.deleted_at, Some(20));

        // An edit revives the tombstone but keeps the synced hash
        record.mark_edited(30);
        assert!(!record.is_tombstoned());
        assert_eq!(record.deleted_at, None);
        assert_eq!(record.content_hash.as_deref(), Some("h1"));
        assert_eq!(record.last_modified, 30);
    }

    #[test]
    fn test_mark_downloaded_copies_remote_identity() {
        let mut remote = FileRecord::observed(50);
        remote.mark_uploaded("remote-hash".into(), "id-9".into(), Some("n.enc".into()));

        let mut local = FileRecord::observed(10);
        local.tombstone(40);
        local.mark_downloaded(&remote);

        assert_eq!(local.content_hash.as_deref(), Some("remote-hash"));
        assert_eq!(local.drive_file_id.as_deref(), Some("id-9"));
        assert!(local.just_downloaded);
        assert!(!local.dirty);
        assert!(!local.is_tombstoned());
    }

    #[test]
    fn test_download_keeps_author_edit_time() {
        let mut remote = FileRecord::observed(100);
        remote.mark_uploaded("h".into(), "id".into(), None);

        let mut local = FileRecord::observed(900);
        local.mark_downloaded(&remote);
        assert_eq!(local.last_modified, 100);

        // A peer that deleted the file at 500 still wins against this copy
        let mut peer = remote.clone();
        peer.tombstone(500);
        assert!(local.last_modified <= peer.deleted_at.unwrap());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let mut record = FileRecord::observed(5);
        record.tombstone(6);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["deletedAt"], 6);
        assert_eq!(json["justDownloaded"], false);
        assert!(json.get("driveFileId").is_some());

        // Missing optional fields default
        let parsed: FileRecord = serde_json::from_str(r#"{"contentHash":"abc"}"#).unwrap();
        assert_eq!(parsed.content_hash.as_deref(), Some("abc"));
        assert!(!parsed.deleted);
    }

    #[tokio::test]
    async fn test_store_persists_through_filesystem() {
        let fs = InMemoryFs::new();
        let path = ".obsidian/plugins/drive-sync/default/metadata.json";

        let empty = MetadataStore::load(&fs, path).await.unwrap();
        assert!(empty.files().is_empty());

        let mut store = MetadataStore::new();
        store.upsert("notes/a.md", FileRecord::observed(1));
        store.tombstone("notes/b.md", 2);
        store.set_salt(Salt::from_bytes(&[3u8; 16]).unwrap());
        store.save(&fs, path).await.unwrap();

        let loaded = MetadataStore::load(&fs, path).await.unwrap();
        assert_eq!(loaded, store);
        assert!(loaded.get("notes/b.md").unwrap().is_tombstoned());
        assert_eq!(loaded.salt().unwrap(), Some(Salt::from_bytes(&[3u8; 16]).unwrap()));
    }

    #[tokio::test]
    async fn test_corrupt_store_is_an_error() {
        let fs = InMemoryFs::new();
        fs.write("meta.json", b"{not json").await.unwrap();
        assert!(matches!(
            MetadataStore::load(&fs, "meta.json").await,
            Err(MetadataError::Serialization(_))
        ));
    }

    #[test]
    fn test_reset_keeps_salt() {
        let mut store = MetadataStore::new();
        store.set_salt(Salt::from_bytes(&[1u8; 16]).unwrap());
        store.upsert("a.md", FileRecord::observed(1));
        store.drive_folder_id = Some("folder".into());

        store.reset();
        assert!(store.files().is_empty());
        assert!(store.drive_folder_id.is_none());
        assert!(store.encryption_salt.is_some());
    }
}
