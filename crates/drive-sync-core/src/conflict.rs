//! Conflict detection and the resolution boundary.
//!
//! A path conflicts only when both replicas changed it since the last shared
//! sync point *and* the two edits ended up with different content:
//!
//! - remote hash != stored local hash (remote changed)
//! - actual local hash != stored local hash (local changed)
//! - actual local hash != remote hash (edits did not converge)

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{self, EncryptionKey};
use crate::error::{Result, SyncError};
use crate::fs::{FileSystem, FsError};
use crate::metadata::FileRecord;
use crate::profile::Profile;
use crate::remote::RemoteStore;
use crate::snapshot::LocalSnapshot;

/// Both candidate contents of a conflicting path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFile {
    pub path: String,
    pub remote_content: Vec<u8>,
    pub local_content: Vec<u8>,
}

/// Content chosen for a conflicting path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: String,
    pub content: Vec<u8>,
}

/// How conflicts are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Hand both versions to a [`ConflictResolver`]
    #[default]
    Ask,
    /// Always keep the local version
    KeepLocal,
    /// Always keep the remote version
    KeepRemote,
}

/// External party that picks the content for each conflicting path.
///
/// Must return a resolution for every presented path.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflicts: Vec<ConflictFile>) -> Vec<Resolution>;
}

/// Three-way conflict test on content hashes.
pub fn is_conflict(remote: Option<&str>, stored: Option<&str>, actual: Option<&str>) -> bool {
    remote != stored && actual != stored && actual != remote
}

/// Meta-paths known to both sides whose edits conflict.
pub fn conflicting_paths(
    remote: &BTreeMap<String, FileRecord>,
    local: &BTreeMap<String, FileRecord>,
    snapshot: &LocalSnapshot,
) -> Vec<String> {
    remote
        .iter()
        .filter(|(path, _)| !Profile::is_manifest_path(path))
        .filter_map(|(path, remote_record)| {
            let local_record = local.get(path)?;
            if remote_record.is_tombstoned() && local_record.is_tombstoned() {
                return None;
            }
            is_conflict(
                remote_record.content_hash.as_deref(),
                local_record.content_hash.as_deref(),
                snapshot.actual_hash(path),
            )
            .then(|| path.clone())
        })
        .collect()
}

/// Gather both contents of each conflicting path for the resolver.
///
/// Remote content is downloaded and decrypted; a tombstoned or never-uploaded
/// remote side, like a missing local file, yields empty content.
pub async fn collect_conflicts<F, R>(
    paths: &[String],
    remote_files: &BTreeMap<String, FileRecord>,
    fs: &F,
    remote: &R,
    key: &EncryptionKey,
    profile: &Profile,
) -> Result<Vec<ConflictFile>>
where
    F: FileSystem + ?Sized,
    R: RemoteStore + ?Sized,
{
    let mut conflicts = Vec::with_capacity(paths.len());
    for path in paths {
        let remote_record = remote_files.get(path);
        let remote_content = match remote_record
            .filter(|r| !r.is_tombstoned())
            .and_then(|r| r.drive_file_id.as_deref())
        {
            Some(file_id) => {
                let encrypted = remote
                    .download_file(file_id)
                    .await
                    .map_err(|e| SyncError::remote("download", path.clone(), e))?;
                crypto::decrypt_content(&encrypted, key).map_err(|e| SyncError::crypto(path.clone(), e))?
            }
            None => Vec::new(),
        };

        let vault_path = profile.to_vault_path(path);
        let local_content = match fs.read(&vault_path).await {
            Ok(bytes) => bytes,
            Err(FsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(SyncError::local(vault_path, e)),
        };

        debug!("Conflict on {}", path);
        conflicts.push(ConflictFile {
            path: path.clone(),
            remote_content,
            local_content,
        });
    }
    Ok(conflicts)
}

/// Resolver that applies a fixed choice without asking anyone.
pub struct PolicyResolver {
    keep_local: bool,
}

impl PolicyResolver {
    pub fn keep_local() -> Self {
        Self { keep_local: true }
    }

    pub fn keep_remote() -> Self {
        Self { keep_local: false }
    }
}

#[async_trait]
impl ConflictResolver for PolicyResolver {
    async fn resolve(&self, conflicts: Vec<ConflictFile>) -> Vec<Resolution> {
        conflicts
            .into_iter()
            .map(|c| Resolution {
                content: if self.keep_local { c.local_content } else { c.remote_content },
                path: c.path,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{compute_content_hash, derive_key_with_rounds, Salt};
    use crate::fs::InMemoryFs;
    use crate::remote::InMemoryRemote;

    fn record(hash: Option<&str>) -> FileRecord {
        let mut record = FileRecord::observed(1);
        record.content_hash = hash.map(str::to_string);
        record.dirty = false;
        record
    }

    #[test]
    fn test_conflict_requires_all_three_conditions() {
        // Both changed, diverged
        assert!(is_conflict(Some("r"), Some("s"), Some("a")));
        // Only remote changed
        assert!(!is_conflict(Some("r"), Some("s"), Some("s")));
        // Only local changed
        assert!(!is_conflict(Some("s"), Some("s"), Some("a")));
        // Both changed to the same content
        assert!(!is_conflict(Some("x"), Some("s"), Some("x")));
        // Nothing changed
        assert!(!is_conflict(Some("s"), Some("s"), Some("s")));
        // Never synced locally, independent remote content
        assert!(is_conflict(Some("r"), None, Some("a")));
        // Local file deleted while remote changed
        assert!(is_conflict(Some("r"), Some("s"), None));
    }

    #[test]
    fn test_conflicting_paths_skips_double_tombstones_and_manifest() {
        let mut remote = BTreeMap::new();
        let mut local = BTreeMap::new();
        let mut snapshot = LocalSnapshot::new();

        remote.insert("a.md".to_string(), record(Some("r")));
        local.insert("a.md".to_string(), record(Some("s")));
        snapshot.insert("a.md", Some("x".to_string()));

        let mut remote_dead = record(Some("r"));
        remote_dead.tombstone(5);
        let mut local_dead = record(Some("s"));
        local_dead.tombstone(6);
        remote.insert("dead.md".to_string(), remote_dead);
        local.insert("dead.md".to_string(), local_dead);

        remote.insert(crate::MANIFEST_FILE_NAME.to_string(), record(Some("r")));
        local.insert(crate::MANIFEST_FILE_NAME.to_string(), record(Some("s")));
        snapshot.insert(crate::MANIFEST_FILE_NAME, Some("x".to_string()));

        // Remote-only paths are never conflicts
        remote.insert("remote-only.md".to_string(), record(Some("r")));

        assert_eq!(conflicting_paths(&remote, &local, &snapshot), vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_collect_conflicts_reads_both_sides() {
        let key = derive_key_with_rounds("pw", &Salt::from_bytes(&[1u8; 16]).unwrap(), 1_000);
        let fs = InMemoryFs::new();
        let remote = InMemoryRemote::new();
        let profile = Profile::new("default");

        fs.write("notes/a.md", b"X").await.unwrap();
        let encrypted = crypto::encrypt_content(b"Y", &key).unwrap();
        let info = remote.upload_file("folder", "n.enc", &encrypted).await.unwrap();

        let mut remote_record = record(Some(&compute_content_hash(b"Y")));
        remote_record.drive_file_id = Some(info.id);
        let mut remote_files = BTreeMap::new();
        remote_files.insert("notes/a.md".to_string(), remote_record);
        remote_files.insert("gone.md".to_string(), {
            let mut r = record(Some("h"));
            r.tombstone(3);
            r
        });

        let paths = vec!["notes/a.md".to_string(), "gone.md".to_string()];
        let conflicts = collect_conflicts(&paths, &remote_files, &fs, &remote, &key, &profile)
            .await
            .unwrap();

        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].local_content, b"X");
        assert_eq!(conflicts[0].remote_content, b"Y");
        assert!(conflicts[1].local_content.is_empty());
        assert!(conflicts[1].remote_content.is_empty());
    }

    #[tokio::test]
    async fn test_policy_resolver() {
        let conflicts = vec![ConflictFile {
            path: "a.md".into(),
            remote_content: b"remote".to_vec(),
            local_content: b"local".to_vec(),
        }];

        let local = PolicyResolver::keep_local().resolve(conflicts.clone()).await;
        assert_eq!(local[0].content, b"local");

        let remote = PolicyResolver::keep_remote().resolve(conflicts).await;
        assert_eq!(remote[0].content, b"remote");
    }
}
