//! Errors that abort a sync attempt.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::fs::FsError;
use crate::manifest::ManifestError;
use crate::metadata::MetadataError;
use crate::remote::RemoteError;

/// Fatal sync error. Every variant aborts the remainder of the sync.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Could not establish the remote manifest: {0}")]
    ManifestBootstrap(String),

    #[error("Wrong password: the remote manifest could not be decrypted")]
    WrongPassword,

    #[error("Remote manifest is corrupted: {0}")]
    CorruptManifest(String),

    #[error("Could not decrypt {path}: wrong password or corrupted remote content")]
    Decryption { path: String },

    #[error("Remote {operation} failed for {path}: {source}")]
    Remote {
        operation: &'static str,
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("Local I/O failed for {path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: FsError,
    },

    #[error("Encryption failed for {path}: {source}")]
    Encryption {
        path: String,
        #[source]
        source: CryptoError,
    },

    #[error("Conflict resolution did not cover {0}")]
    UnresolvedConflict(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn remote(operation: &'static str, path: impl Into<String>, source: RemoteError) -> Self {
        match source {
            RemoteError::Auth(message) => SyncError::Auth(message),
            source => SyncError::Remote {
                operation,
                path: path.into(),
                source,
            },
        }
    }

    pub fn local(path: impl Into<String>, source: FsError) -> Self {
        SyncError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Decryption failures become per-path errors; anything else is an encryption failure.
    pub fn crypto(path: impl Into<String>, source: CryptoError) -> Self {
        match source {
            CryptoError::Decryption | CryptoError::Truncated(_) => {
                SyncError::Decryption { path: path.into() }
            }
            source => SyncError::Encryption {
                path: path.into(),
                source,
            },
        }
    }

    /// Whether the user should be told their password is wrong.
    pub fn is_wrong_password(&self) -> bool {
        matches!(self, SyncError::WrongPassword)
    }
}

impl From<ManifestError> for SyncError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Crypto(CryptoError::Decryption) => SyncError::WrongPassword,
            ManifestError::Crypto(e) => SyncError::CorruptManifest(e.to_string()),
            ManifestError::Truncated(len) => {
                SyncError::CorruptManifest(format!("only {} bytes", len))
            }
            ManifestError::Serialization(e) => SyncError::CorruptManifest(e),
            ManifestError::Remote(e) => SyncError::remote("manifest exchange", "manifest", e),
            e @ ManifestError::Bootstrap { .. } => SyncError::ManifestBootstrap(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_decryption_failure_is_wrong_password() {
        let err: SyncError = ManifestError::Crypto(CryptoError::Decryption).into();
        assert!(err.is_wrong_password());
        assert!(err.to_string().contains("Wrong password"));
    }

    #[test]
    fn test_remote_auth_errors_are_promoted() {
        let err = SyncError::remote("upload", "a.md", RemoteError::Auth("token expired".into()));
        assert!(matches!(err, SyncError::Auth(_)));

        let err = SyncError::remote(
            "upload",
            "a.md",
            RemoteError::Status {
                operation: "upload_file".into(),
                status: 500,
                message: "boom".into(),
            },
        );
        let message = err.to_string();
        assert!(message.contains("upload"));
        assert!(message.contains("a.md"));
        assert!(message.contains("500"));
    }

    #[test]
    fn test_bootstrap_failure_maps_to_bootstrap_error() {
        let err: SyncError = ManifestError::Bootstrap { attempts: 5 }.into();
        assert!(matches!(err, SyncError::ManifestBootstrap(_)));
    }
}
