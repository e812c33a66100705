//! Configuration loading and management

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use drive_sync_core::{ConflictPolicy, Profile, RetryConfig, SyncOptions, DEFAULT_REMOTE_FOLDER};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vault root (overridden by `--vault`)
    #[serde(default)]
    pub vault_path: Option<PathBuf>,

    /// Drive folder shared by every replica of the vault
    #[serde(default = "default_remote_folder")]
    pub remote_folder_name: String,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Backoff for transient Drive failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Seconds between syncs in `watch` mode
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_profiles")]
    pub profiles: Vec<Profile>,
}

fn default_remote_folder() -> String {
    DEFAULT_REMOTE_FOLDER.to_string()
}

fn default_sync_interval() -> u64 {
    300 // 5 minutes
}

fn default_profiles() -> Vec<Profile> {
    vec![Profile::new("default")]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_path: None,
            remote_folder_name: default_remote_folder(),
            conflict_policy: ConflictPolicy::default(),
            retry: RetryConfig::default(),
            sync_interval_secs: default_sync_interval(),
            profiles: default_profiles(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory, writing defaults on first run
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            config.validate()?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            bail!("At least one profile must be configured");
        }
        for (i, profile) in self.profiles.iter().enumerate() {
            if profile.name.trim().is_empty() {
                bail!("Profile #{} has an empty name", i + 1);
            }
            if self.profiles[..i].iter().any(|p| p.name == profile.name) {
                bail!("Duplicate profile name: {}", profile.name);
            }
        }
        Ok(())
    }

    /// Profiles to act on: the named one, or all of them.
    pub fn select_profiles(&self, name: Option<&str>) -> Result<Vec<Profile>> {
        match name {
            Some(name) => match self.profiles.iter().find(|p| p.name == name) {
                Some(profile) => Ok(vec![profile.clone()]),
                None => bail!("Unknown profile: {}", name),
            },
            None => Ok(self.profiles.clone()),
        }
    }

    pub fn sync_options(&self, kdf_rounds: u32) -> SyncOptions {
        SyncOptions {
            remote_folder_name: self.remote_folder_name.clone(),
            conflict_policy: self.conflict_policy,
            retry: self.retry.clone(),
            kdf_rounds,
            ..SyncOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("drive-sync");

        let config = Config::load(&config_dir).unwrap();
        assert_eq!(config.remote_folder_name, DEFAULT_REMOTE_FOLDER);
        assert_eq!(config.profiles, vec![Profile::new("default")]);
        assert!(config_dir.join(CONFIG_FILE).exists());

        // Second load reads the file back
        let reloaded = Config::load(&config_dir).unwrap();
        assert_eq!(reloaded.sync_interval_secs, 300);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{
                "conflict_policy": "keep_remote",
                "profiles": [
                    { "name": "work", "local_folder": "Work" },
                    { "name": "all", "include_config_dir": true }
                ]
            }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepRemote);
        assert_eq!(config.profiles[0].local_folder, "Work");
        assert_eq!(config.profiles[0].config_dir, ".obsidian");
        assert!(config.profiles[1].include_config_dir);

        let selected = config.select_profiles(Some("work")).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(config.select_profiles(None).unwrap().len(), 2);
        assert!(config.select_profiles(Some("missing")).is_err());
    }

    #[test]
    fn test_duplicate_profiles_are_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "profiles": [ { "name": "a" }, { "name": "a" } ] }"#,
        )
        .unwrap();

        let err = Config::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Duplicate profile"));
    }

    #[test]
    fn test_sync_options_follow_config() {
        let config = Config {
            remote_folder_name: "vault-backup".into(),
            conflict_policy: ConflictPolicy::KeepLocal,
            ..Config::default()
        };
        let options = config.sync_options(1_000);
        assert_eq!(options.remote_folder_name, "vault-backup");
        assert_eq!(options.conflict_policy, ConflictPolicy::KeepLocal);
        assert_eq!(options.kdf_rounds, 1_000);
    }
}
