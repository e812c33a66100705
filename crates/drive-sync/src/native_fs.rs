//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use drive_sync_core::fs::{FileEntry, FileSystem, FsError, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Vault on the local disk
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a vault-relative path. Only plain components are accepted,
    /// so `..`, roots and drive prefixes cannot leave the vault.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut full = self.base_path.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(full)
    }
}

fn map_err(path: &str, err: std::io::Error) -> FsError {
    match err.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::IsADirectory => FsError::IsDirectory(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, err)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::read(&full_path).await.map_err(|e| map_err(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_err(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path)?;
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_err(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await.map_err(|e| map_err(path, e))?;

            entries.push(FileEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path).await.map_err(|e| map_err(path, e))
        } else {
            fs::remove_file(&full_path).await.map_err(|e| map_err(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        fs::try_exists(&full_path).await.map_err(|e| map_err(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| map_err(path, e))
    }
}
