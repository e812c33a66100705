//! drive-sync library: Exposes the host components for testing.
//!
//! This is a thin library layer over the command-line host,
//! allowing integration tests to access its types.

pub mod config;
pub mod drive;
pub mod native_fs;
pub mod prompt;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Config, CONFIG_FILE};
pub use drive::DriveClient;
pub use native_fs::NativeFs;
pub use prompt::{PromptResolver, TerminalResolver};
pub use watcher::FileWatcher;
