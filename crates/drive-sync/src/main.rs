//! drive-sync: Encrypted sync of a local vault with a Google Drive folder.
//!
//! Runs the drive-sync-core engine on the native filesystem,
//! with the Drive REST API as the remote store.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use drive_sync::{Config, DriveClient, FileWatcher, NativeFs, TerminalResolver};
use drive_sync_core::crypto::PBKDF2_ROUNDS;
use drive_sync_core::journal::Journal;
use drive_sync_core::{
    load_profile_store, ConflictResolver, KeyRing, MetadataStore, Profile, ProfileStatus,
    RetryingRemote, Subscription, SyncEngine, SyncError, SyncEvent, SyncOutcome,
};

type HostFs = Arc<NativeFs>;
type HostRemote = Arc<RetryingRemote<DriveClient>>;
type Engine = SyncEngine<HostFs, HostRemote>;

#[derive(Parser, Debug)]
#[command(name = "drive-sync")]
#[command(about = "Encrypted vault sync with Google Drive")]
struct Args {
    /// Directory holding config.json
    #[arg(long, default_value = ".drive-sync", env = "DRIVE_SYNC_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Path to the vault directory (overrides config.json)
    #[arg(short, long)]
    vault: Option<PathBuf>,

    /// Encryption password
    #[arg(long, env = "DRIVE_SYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// OAuth access token for Google Drive
    #[arg(long, env = "DRIVE_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync once and exit
    Sync {
        /// Only sync this profile
        #[arg(long)]
        profile: Option<String>,
    },
    /// Show local sync state for every profile
    Status,
    /// Sync on local changes and on a timer until interrupted
    Watch,
    /// Forget a profile's sync state (the salt is kept)
    Reset {
        #[arg(long)]
        profile: String,
    },
}

/// Engines for the selected profiles, with their progress loggers.
struct Host {
    engines: Vec<Engine>,
    _subscriptions: Vec<Subscription>,
    resolver: TerminalResolver,
}

impl Host {
    async fn open(args: &Args, config: &Config, vault: &Path, profiles: Vec<Profile>) -> Result<Self> {
        // No token means no Drive access at all; fail before touching the network
        let client = DriveClient::new(args.token.clone().unwrap_or_default())
            .map_err(|e| SyncError::remote("authorize", "", e))?;
        let Some(password) = args.password.clone() else {
            bail!("No password given: set DRIVE_SYNC_PASSWORD or pass --password");
        };

        let fs: HostFs = Arc::new(NativeFs::new(vault.to_path_buf()));
        let remote: HostRemote = Arc::new(RetryingRemote::new(client, config.retry.clone()));
        let options = config.sync_options(PBKDF2_ROUNDS);

        let mut engines = Vec::with_capacity(profiles.len());
        let mut subscriptions = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let (store, salt) = load_profile_store(&*fs, &profile)
                .await
                .with_context(|| format!("Failed to load state for profile {}", profile.name))?;

            // PBKDF2 at full strength takes a while; keep it off the runtime threads
            let password = password.clone();
            let rounds = options.kdf_rounds;
            let keys = tokio::task::spawn_blocking(move || KeyRing::with_rounds(&password, salt, rounds))
                .await
                .context("Key derivation task failed")?;

            let engine = SyncEngine::new(
                Arc::clone(&fs),
                Arc::clone(&remote),
                profile,
                store,
                keys,
                options.clone(),
            );
            subscriptions.push(engine.events().subscribe(log_event));
            engines.push(engine);
        }

        Ok(Self {
            engines,
            _subscriptions: subscriptions,
            resolver: TerminalResolver::stdio(),
        })
    }

    /// Sync every profile in turn, stopping at the first failure.
    async fn sync_all(&self) -> Result<()> {
        let resolver: &dyn ConflictResolver = &self.resolver;
        for engine in &self.engines {
            let name = &engine.profile().name;
            match engine.sync(resolver).await {
                Ok(SyncOutcome::Completed(report)) => {
                    if report.recovered_uploads > 0 {
                        info!(
                            "Rolled back {} upload(s) from an interrupted sync of {}",
                            report.recovered_uploads, name
                        );
                    }
                    debug!(
                        "Profile {}: {} action(s), {} skipped, {} conflict(s)",
                        name,
                        report.actions.len(),
                        report.skipped,
                        report.conflicts.len()
                    );
                }
                Ok(SyncOutcome::AlreadyRunning) => {
                    info!("Profile {} is already syncing", name);
                }
                Err(e) => {
                    if e.is_wrong_password() {
                        error!("Wrong password for profile {}", name);
                    }
                    return Err(e).with_context(|| format!("Sync failed for profile {}", name));
                }
            }
        }
        Ok(())
    }

    /// Vault directories the watcher must not report.
    fn state_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.engines.iter().map(|e| e.profile().state_dir()).collect();
        dirs.dedup();
        dirs
    }

    /// Forget engine writes whose file events never showed up.
    fn expire_echoes(&self) {
        for engine in &self.engines {
            engine.tracker().cleanup_expired();
        }
    }

    async fn on_local_event(&self, event: drive_sync_core::LocalEvent) {
        for engine in &self.engines {
            if let Err(e) = engine.handle_local_event(&event).await {
                warn!("Failed to record {:?} for {}: {}", event, engine.profile().name, e);
            }
        }
    }
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::SyncStarted { profile } => info!("Syncing profile {}", profile),
        SyncEvent::ConflictsDetected { paths } => {
            warn!("{} conflict(s): {}", paths.len(), paths.join(", "))
        }
        SyncEvent::ActionCompleted {
            completed,
            total,
            kind,
            path,
        } => info!("[{}/{}] {} {}", completed, total, kind, path),
        SyncEvent::SyncFinished {
            profile, actions, ..
        } => info!("Profile {} synced ({} action(s))", profile, actions),
    }
}

fn vault_path(args: &Args, config: &Config) -> Result<PathBuf> {
    args.vault
        .clone()
        .or_else(|| config.vault_path.clone())
        .context("No vault path: pass --vault or set vault_path in config.json")
}

async fn print_status(vault: &Path, profiles: &[Profile]) -> Result<()> {
    let fs = NativeFs::new(vault.to_path_buf());
    for profile in profiles {
        let store = MetadataStore::load(&fs, &profile.metadata_path()).await?;
        let status = ProfileStatus::from_store(profile, &store);
        let last_sync = status
            .last_sync
            .map(|t| format!("{} ms since epoch", t))
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}: {} tracked, {} pending upload, {} deleted, last sync {}",
            status.profile, status.tracked, status.dirty, status.tombstoned, last_sync
        );
    }
    Ok(())
}

async fn reset_profile(vault: &Path, profile: &Profile) -> Result<()> {
    let fs = NativeFs::new(vault.to_path_buf());
    let path = profile.metadata_path();
    let mut store = MetadataStore::load(&fs, &path).await?;
    store.reset();
    store.save(&fs, &path).await?;
    Journal::clear(&fs, &profile.journal_path()).await?;
    info!("Reset sync state for profile {}", profile.name);
    Ok(())
}

async fn watch(host: Host, vault: &Path, interval_secs: u64) -> Result<()> {
    let mut watcher = FileWatcher::new(vault.to_path_buf(), host.state_dirs())?;
    info!("File watcher started on {:?}", watcher.vault_path());

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    info!("Watching. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            Some(event) = watcher.event_rx().recv() => {
                host.on_local_event(event).await;
            }

            // First tick fires immediately
            _ = ticker.tick() => {
                host.expire_echoes();
                if let Err(e) = host.sync_all().await {
                    error!("{:#}", e);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,drive_sync=debug,drive_sync_core=debug"
    } else {
        "info,drive_sync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config_dir)?;
    let vault = vault_path(&args, &config)?;
    debug!("Vault path: {:?}", vault);

    match &args.command {
        Command::Sync { profile } => {
            let profiles = config.select_profiles(profile.as_deref())?;
            let host = Host::open(&args, &config, &vault, profiles).await?;
            host.sync_all().await?;
        }
        Command::Status => {
            print_status(&vault, &config.profiles).await?;
        }
        Command::Watch => {
            let profiles = config.select_profiles(None)?;
            let host = Host::open(&args, &config, &vault, profiles).await?;
            watch(host, &vault, config.sync_interval_secs).await?;
        }
        Command::Reset { profile } => {
            let profiles = config.select_profiles(Some(profile.as_str()))?;
            for profile in &profiles {
                reset_profile(&vault, profile).await?;
            }
        }
    }

    Ok(())
}
