//! Sync profiles and meta-path scoping.
//!
//! A profile scopes the engine to a sub-folder of the vault. Every path that
//! enters the engine is converted to a *meta-path* (the path relative to the
//! profile's local folder) so that profiles with different local folders can
//! share one remote folder without colliding.

use serde::{Deserialize, Serialize};

use crate::manifest::MANIFEST_FILE_NAME;

/// Host configuration directory inside the vault.
pub const DEFAULT_CONFIG_DIR: &str = ".obsidian";

/// Directory (below the config dir) holding per-profile engine state.
const STATE_DIR: &str = "plugins/drive-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name, also used to namespace its local state
    pub name: String,

    /// Vault-relative folder this profile syncs (empty = whole vault)
    #[serde(default)]
    pub local_folder: String,

    /// Whether files under the host config directory are synced
    #[serde(default)]
    pub include_config_dir: bool,

    /// Host config directory name
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
}

fn default_config_dir() -> String {
    DEFAULT_CONFIG_DIR.to_string()
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_folder: String::new(),
            include_config_dir: false,
            config_dir: default_config_dir(),
        }
    }

    pub fn with_local_folder(mut self, folder: impl Into<String>) -> Self {
        let folder: String = folder.into();
        self.local_folder = folder.trim_matches('/').to_string();
        self
    }

    pub fn with_config_dir_included(mut self, include: bool) -> Self {
        self.include_config_dir = include;
        self
    }

    fn folder(&self) -> &str {
        self.local_folder.trim_matches('/')
    }

    /// Convert a vault path to a meta-path.
    ///
    /// Returns `None` for paths outside the profile's folder and for the
    /// engine's own state files, which are never synced.
    pub fn to_meta_path(&self, vault_path: &str) -> Option<String> {
        let vault_path = vault_path.trim_matches('/');
        if vault_path.is_empty() || self.is_state_path(vault_path) {
            return None;
        }

        let folder = self.folder();
        if folder.is_empty() {
            return Some(vault_path.to_string());
        }

        vault_path
            .strip_prefix(folder)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }

    /// Convert a meta-path back to a vault path.
    pub fn to_vault_path(&self, meta_path: &str) -> String {
        let meta_path = meta_path.trim_matches('/');
        let folder = self.folder();
        if folder.is_empty() {
            meta_path.to_string()
        } else {
            format!("{}/{}", folder, meta_path)
        }
    }

    /// Whether a meta-path falls under the host config directory.
    pub fn is_config_path(&self, meta_path: &str) -> bool {
        let vault_path = self.to_vault_path(meta_path);
        vault_path == self.config_dir || vault_path.starts_with(&format!("{}/", self.config_dir))
    }

    /// Whether this profile syncs a meta-path. Config files only when enabled.
    pub fn syncs_path(&self, meta_path: &str) -> bool {
        self.include_config_dir || !self.is_config_path(meta_path)
    }

    /// Whether a meta-path is the shared manifest's well-known name.
    pub fn is_manifest_path(meta_path: &str) -> bool {
        meta_path == MANIFEST_FILE_NAME
    }

    /// Vault directory holding this profile's metadata and journal.
    pub fn state_dir(&self) -> String {
        format!("{}/{}/{}", self.config_dir, STATE_DIR, self.name)
    }

    pub fn metadata_path(&self) -> String {
        format!("{}/metadata.json", self.state_dir())
    }

    pub fn journal_path(&self) -> String {
        format!("{}/journal.json", self.state_dir())
    }

    fn is_state_path(&self, vault_path: &str) -> bool {
        let root = format!("{}/{}", self.config_dir, STATE_DIR);
        vault_path == root || vault_path.starts_with(&format!("{}/", root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_vault_profile_is_identity() {
        let profile = Profile::new("default");
        assert_eq!(profile.to_meta_path("notes/a.md").as_deref(), Some("notes/a.md"));
        assert_eq!(profile.to_vault_path("notes/a.md"), "notes/a.md");
    }

    #[test]
    fn test_folder_profile_strips_prefix() {
        let profile = Profile::new("work").with_local_folder("Work/");

        assert_eq!(profile.to_meta_path("Work/notes/a.md").as_deref(), Some("notes/a.md"));
        assert_eq!(profile.to_vault_path("notes/a.md"), "Work/notes/a.md");

        // Outside the folder, or sharing only a name prefix
        assert_eq!(profile.to_meta_path("Personal/a.md"), None);
        assert_eq!(profile.to_meta_path("Workbench/a.md"), None);
        assert_eq!(profile.to_meta_path("Work"), None);
    }

    #[test]
    fn test_state_files_are_never_meta_paths() {
        let profile = Profile::new("default").with_config_dir_included(true);
        assert_eq!(profile.to_meta_path(&profile.metadata_path()), None);
        assert_eq!(profile.to_meta_path(&profile.journal_path()), None);
        assert_eq!(
            profile.to_meta_path(".obsidian/app.json").as_deref(),
            Some(".obsidian/app.json")
        );
    }

    #[test]
    fn test_config_path_detection() {
        let profile = Profile::new("default");
        assert!(profile.is_config_path(".obsidian/app.json"));
        assert!(!profile.is_config_path(".obsidianish/a.md"));
        assert!(!profile.is_config_path("notes/a.md"));

        let scoped = Profile::new("work").with_local_folder("Work");
        assert!(!scoped.is_config_path(".obsidian/app.json"));
    }
}
