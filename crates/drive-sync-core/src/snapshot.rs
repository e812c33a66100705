//! Actual content hashes of local files at sync time.
//!
//! Stored hashes go stale as soon as a file is edited, so every sync re-hashes
//! the files it is about to compare. Both the conflict detector and the
//! planner read from the same snapshot.

use std::collections::BTreeMap;

use crate::crypto::compute_content_hash;
use crate::fs::{FileSystem, FsError};
use crate::profile::Profile;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSnapshot {
    hashes: BTreeMap<String, Option<String>>,
}

impl LocalSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the actual hash of a meta-path (`None` = no file on disk).
    pub fn insert(&mut self, meta_path: impl Into<String>, hash: Option<String>) {
        self.hashes.insert(meta_path.into(), hash);
    }

    /// Actual hash of a meta-path. Paths never captured read as absent.
    pub fn actual_hash(&self, meta_path: &str) -> Option<&str> {
        self.hashes.get(meta_path).and_then(|h| h.as_deref())
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Hash the current on-disk bytes of every given meta-path.
    pub async fn capture<'a, F, I>(fs: &F, profile: &Profile, meta_paths: I) -> Result<Self, FsError>
    where
        F: FileSystem + ?Sized,
        I: IntoIterator<Item = &'a String>,
    {
        let mut snapshot = Self::new();
        for meta_path in meta_paths {
            let vault_path = profile.to_vault_path(meta_path);
            let hash = if fs.exists(&vault_path).await? {
                match fs.read(&vault_path).await {
                    Ok(bytes) => Some(compute_content_hash(&bytes)),
                    // A folder now occupies the path
                    Err(FsError::IsDirectory(_)) => None,
                    Err(e) => return Err(e),
                }
            } else {
                None
            };
            snapshot.insert(meta_path.clone(), hash);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    #[tokio::test]
    async fn test_capture_hashes_present_files_only() {
        let fs = InMemoryFs::new();
        fs.write("Work/a.md", b"alpha").await.unwrap();
        fs.mkdir("Work/folder").await.unwrap();

        let profile = Profile::new("work").with_local_folder("Work");
        let paths = vec!["a.md".to_string(), "gone.md".to_string(), "folder".to_string()];
        let snapshot = LocalSnapshot::capture(&fs, &profile, &paths).await.unwrap();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.actual_hash("a.md"), Some(compute_content_hash(b"alpha").as_str()));
        assert_eq!(snapshot.actual_hash("gone.md"), None);
        assert_eq!(snapshot.actual_hash("folder"), None);
        assert_eq!(snapshot.actual_hash("never-captured.md"), None);
    }
}
