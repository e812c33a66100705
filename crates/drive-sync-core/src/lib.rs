//! drive-sync-core: Encrypted, manifest-based sync between a local vault and a
//! remote object store.
//!
//! This crate provides:
//! - Client-side encryption of file contents, names and the shared manifest
//! - Three-way conflict detection and a pure sync planner
//! - The sync executor with a recovery journal for interrupted syncs
//! - FileSystem and RemoteStore trait abstractions with in-memory versions

pub mod conflict;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod fs;
pub mod journal;
pub mod manifest;
pub mod metadata;
pub mod planner;
pub mod profile;
pub mod remote;
pub mod snapshot;
pub mod tracker;

pub use conflict::{ConflictFile, ConflictPolicy, ConflictResolver, PolicyResolver, Resolution};
pub use crypto::{EncryptionKey, KeyRing, Salt};
pub use engine::{
    load_profile_store, ProfileStatus, SyncEngine, SyncOptions, SyncOutcome, SyncReport,
    DEFAULT_REMOTE_FOLDER,
};
pub use error::{Result, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use fs::{FileEntry, FileSystem, FsError, InMemoryFs};
pub use manifest::MANIFEST_FILE_NAME;
pub use metadata::{FileRecord, MetadataStore};
pub use planner::{ActionKind, SyncAction};
pub use profile::Profile;
pub use remote::{InMemoryRemote, RemoteError, RemoteFile, RemoteStore, RetryConfig, RetryingRemote};
pub use tracker::{ChangeTracker, LocalEvent};
