//! FileSystem trait abstraction for the local vault.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in drive-sync) - Uses tokio::fs
//!
//! All paths are vault-relative and use `/` as separator. The engine converts
//! them to and from meta-paths through the active [`Profile`](crate::Profile).

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Path escapes the vault: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents (files and folders)
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Recursively list every file below `root` as vault-relative paths.
pub async fn walk_files<F: FileSystem + ?Sized>(fs: &F, root: &str) -> Result<Vec<String>> {
    let root = root.trim_matches('/').to_string();
    let mut files = Vec::new();

    if !root.is_empty() && !fs.exists(&root).await? {
        return Ok(files);
    }

    let mut dirs_to_visit = vec![root];
    while let Some(dir) = dirs_to_visit.pop() {
        for entry in fs.list(&dir).await? {
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir, entry.name)
            };

            if entry.is_dir {
                dirs_to_visit.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Parent directory of a vault-relative path (`None` for top-level entries).
pub fn parent_dir(path: &str) -> Option<&str> {
    path.trim_matches('/').rsplit_once('/').map(|(parent, _)| parent)
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    /// Snapshot of every file path currently stored.
    pub fn file_paths(&self) -> Vec<String> {
        self.files.read().unwrap().keys().cloned().collect()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        // Create parent directories
        if let Some(parent) = parent_dir(&path) {
            self.mkdir(parent).await?;
        }

        let mut files = self.files.write().unwrap();
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();

        let files = self.files.read().unwrap();
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        // Try to delete as file first
        {
            let mut files = self.files.write().unwrap();
            if files.remove(&path).is_some() {
                return Ok(());
            }
        }

        // Only empty directories can be removed
        let prefix = format!("{}/", path);
        let has_children = self.files.read().unwrap().keys().any(|p| p.starts_with(&prefix))
            || self.dirs.read().unwrap().iter().any(|d| d.starts_with(&prefix));
        if has_children {
            return Err(FsError::Io(format!("Directory not empty: {}", path)));
        }

        let mut dirs = self.dirs.write().unwrap();
        if !path.is_empty() && dirs.remove(&path) {
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }
        if self.files.read().unwrap().contains_key(&path) {
            return Err(FsError::Io(format!("Not a directory: {}", path)));
        }

        let mut dirs = self.dirs.write().unwrap();
        let mut current = String::new();
        for segment in path.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            dirs.insert(current.clone());
        }
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing a filesystem between an engine and test assertions
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}
