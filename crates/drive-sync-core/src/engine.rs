//! SyncEngine: runs one profile's sync against the remote folder.
//!
//! A sync proceeds in fixed phases:
//!
//! 1. Replay any journal left by an interrupted sync
//! 2. Fetch (or bootstrap) the manifest, adopting its salt
//! 3. Re-hash local files and detect conflicts
//! 4. Resolve conflicts by policy or through the caller's resolver
//! 5. Plan and apply actions one at a time, journaling progress
//! 6. Write resolved contents locally, publish the manifest, save metadata

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::conflict::{self, ConflictPolicy, ConflictResolver};
use crate::crypto::{self, KeyRing, Salt, PBKDF2_ROUNDS};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::fs::{parent_dir, FileSystem, FsError};
use crate::journal::{recover_interrupted, Journal};
use crate::manifest::{self, ManifestExchange, ManifestSession};
use crate::metadata::{now_millis, FileRecord, MetadataStore};
use crate::planner::{filter_config_actions, plan_sync, ActionKind, SyncAction};
use crate::profile::Profile;
use crate::remote::{RemoteError, RemoteStore, RetryConfig};
use crate::snapshot::LocalSnapshot;
use crate::tracker::{ChangeTracker, LocalEvent, ECHO_TTL};

/// Remote folder used when none is configured.
pub const DEFAULT_REMOTE_FOLDER: &str = "drive-sync";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub remote_folder_name: String,
    pub conflict_policy: ConflictPolicy,
    pub retry: RetryConfig,
    /// Key-derivation iterations
    pub kdf_rounds: u32,
    /// How long an engine write waits for its file-event echo once the sync is over
    pub echo_ttl: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            remote_folder_name: DEFAULT_REMOTE_FOLDER.to_string(),
            conflict_policy: ConflictPolicy::default(),
            retry: RetryConfig::default(),
            kdf_rounds: PBKDF2_ROUNDS,
            echo_ttl: ECHO_TTL,
        }
    }
}

/// What a completed sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Planned actions, in execution order
    pub actions: Vec<SyncAction>,
    /// Actions that turned out to have nothing to do
    pub skipped: usize,
    pub conflicts: Vec<String>,
    /// This sync published the first manifest in the folder
    pub bootstrapped: bool,
    pub salt_adopted: bool,
    /// Uploads rolled back from an interrupted sync
    pub recovered_uploads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another sync of this profile was in flight; nothing was done
    AlreadyRunning,
    Completed(SyncReport),
}

/// Summary of a profile's local sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileStatus {
    pub profile: String,
    pub last_sync: Option<u64>,
    pub tracked: usize,
    pub dirty: usize,
    pub tombstoned: usize,
}

impl ProfileStatus {
    pub fn from_store(profile: &Profile, store: &MetadataStore) -> Self {
        let files = store.files();
        Self {
            profile: profile.name.clone(),
            last_sync: store.last_sync,
            tracked: files.len(),
            dirty: files.values().filter(|r| r.dirty && !r.is_tombstoned()).count(),
            tombstoned: files.values().filter(|r| r.is_tombstoned()).count(),
        }
    }
}

/// Load a profile's metadata, generating and persisting a salt on first use.
pub async fn load_profile_store<F: FileSystem + ?Sized>(
    fs: &F,
    profile: &Profile,
) -> Result<(MetadataStore, Salt)> {
    let path = profile.metadata_path();
    let mut store = MetadataStore::load(fs, &path).await?;
    let salt = match store.salt()? {
        Some(salt) => salt,
        None => {
            let salt = Salt::generate();
            info!("Generated encryption salt for profile {}", profile.name);
            store.set_salt(salt);
            store.save(fs, &path).await?;
            salt
        }
    };
    Ok((store, salt))
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine<F: FileSystem, R: RemoteStore> {
    fs: F,
    remote: R,
    profile: Profile,
    options: SyncOptions,
    store: Mutex<MetadataStore>,
    keys: Mutex<KeyRing>,
    running: AtomicBool,
    events: Arc<EventBus>,
    tracker: Arc<ChangeTracker>,
}

impl<F: FileSystem, R: RemoteStore> SyncEngine<F, R> {
    /// Engine over an already loaded store and derived key.
    pub fn new(
        fs: F,
        remote: R,
        profile: Profile,
        store: MetadataStore,
        keys: KeyRing,
        options: SyncOptions,
    ) -> Self {
        let tracker = Arc::new(ChangeTracker::with_ttl(profile.clone(), options.echo_ttl));
        Self {
            fs,
            remote,
            profile,
            options,
            store: Mutex::new(store),
            keys: Mutex::new(keys),
            running: AtomicBool::new(false),
            events: Arc::new(EventBus::new()),
            tracker,
        }
    }

    /// Load the profile's store and derive its key inline.
    pub async fn open(
        fs: F,
        remote: R,
        profile: Profile,
        password: &str,
        options: SyncOptions,
    ) -> Result<Self> {
        let (store, salt) = load_profile_store(&fs, &profile).await?;
        let keys = KeyRing::with_rounds(password, salt, options.kdf_rounds);
        Ok(Self::new(fs, remote, profile, store, keys, options))
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Copy of the current metadata store.
    pub async fn metadata(&self) -> MetadataStore {
        self.store.lock().await.clone()
    }

    pub async fn status(&self) -> ProfileStatus {
        let store = self.store.lock().await;
        ProfileStatus::from_store(&self.profile, &store)
    }

    /// Apply a host file event and persist the store.
    pub async fn handle_local_event(&self, event: &LocalEvent) -> Result<()> {
        let mut store = self.store.lock().await;
        self.tracker.apply(&mut store, event, now_millis());
        store.save(&self.fs, &self.profile.metadata_path()).await?;
        Ok(())
    }

    /// Forget all records and remote bindings for this profile. The salt is kept.
    pub async fn reset(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        store.reset();
        store.save(&self.fs, &self.profile.metadata_path()).await?;
        Journal::clear(&self.fs, &self.profile.journal_path()).await?;
        info!("Reset metadata for profile {}", self.profile.name);
        Ok(())
    }

    /// Run one sync. Returns `AlreadyRunning` if this profile is mid-sync.
    pub async fn sync(&self, resolver: &dyn ConflictResolver) -> Result<SyncOutcome> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Sync already running for profile {}", self.profile.name);
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let mut store = self.store.lock().await;
        let mut keys = self.keys.lock().await;
        let result = self.run(&mut store, &mut keys, resolver).await;
        // Echoes of this sync's writes queue up behind it; their TTL starts now
        self.tracker.refresh_pending();
        Ok(SyncOutcome::Completed(result?))
    }

    async fn run(
        &self,
        store: &mut MetadataStore,
        keys: &mut KeyRing,
        resolver: &dyn ConflictResolver,
    ) -> Result<SyncReport> {
        let metadata_path = self.profile.metadata_path();
        let journal_path = self.profile.journal_path();
        let mut report = SyncReport::default();

        self.events.emit(SyncEvent::SyncStarted {
            profile: self.profile.name.clone(),
        });
        info!("Syncing profile {}", self.profile.name);

        if let Some(rolled_back) = recover_interrupted(&self.fs, &journal_path, store).await? {
            report.recovered_uploads = rolled_back;
            store.save(&self.fs, &metadata_path).await?;
        }

        self.tracker
            .initial_scan(&self.fs, store, now_millis())
            .await
            .map_err(|e| SyncError::local(self.profile.to_vault_path(""), e))?;

        let exchange = ManifestExchange::new(
            &self.remote,
            &self.options.remote_folder_name,
            &self.options.retry,
        );
        let session = exchange.open(keys).await?;
        report.bootstrapped = session.bootstrapped;
        report.salt_adopted = session.salt_adopted;
        if session.salt_adopted {
            store.set_salt(keys.salt());
        }
        store.drive_folder_id = Some(session.folder_id.clone());
        let remote_files = &session.manifest.files;

        let snapshot = self.capture_snapshot(remote_files, store).await?;

        let mut conflicts = conflict::conflicting_paths(remote_files, store.files(), &snapshot);
        conflicts.retain(|path| self.profile.syncs_path(path));
        let resolutions = self
            .resolve_conflicts(&conflicts, remote_files, keys, resolver)
            .await?;

        let actions = filter_config_actions(
            plan_sync(
                remote_files,
                store.files(),
                &snapshot,
                &conflicts,
                self.options.conflict_policy,
            ),
            &self.profile,
        );
        debug!("Planned {} action(s)", actions.len());

        let mut journal = Journal::begin(&actions, store, now_millis());
        if !actions.is_empty() {
            journal.save(&self.fs, &journal_path).await?;
        }

        let total = actions.len();
        for (index, action) in actions.iter().enumerate() {
            let applied = self
                .apply_action(action, store, keys, &session, resolutions.get(&action.path))
                .await?;
            if !applied {
                report.skipped += 1;
            }

            journal.mark_completed(index);
            journal.save(&self.fs, &journal_path).await?;
            store.save(&self.fs, &metadata_path).await?;

            self.events.emit(SyncEvent::ActionCompleted {
                completed: index + 1,
                total,
                kind: action.kind,
                path: action.path.clone(),
            });
        }

        self.write_resolutions(&resolutions, store).await?;
        adopt_remote_tombstones(remote_files, store, &self.profile);

        let published = manifest::merge_records(remote_files, store.files(), &self.profile);
        exchange.finalize(&session, published, keys).await?;
        let now = now_millis();
        store.last_sync = Some(now);
        store.save(&self.fs, &metadata_path).await?;
        Journal::clear(&self.fs, &journal_path).await?;

        info!(
            "Sync of profile {} finished: {} action(s), {} conflict(s)",
            self.profile.name,
            actions.len(),
            conflicts.len()
        );
        self.events.emit(SyncEvent::SyncFinished {
            profile: self.profile.name.clone(),
            actions: actions.len(),
            timestamp: now,
        });

        report.actions = actions;
        report.conflicts = conflicts;
        Ok(report)
    }

    async fn capture_snapshot(
        &self,
        remote_files: &BTreeMap<String, FileRecord>,
        store: &MetadataStore,
    ) -> Result<LocalSnapshot> {
        let paths: Vec<&String> = remote_files
            .keys()
            .chain(store.files().keys())
            .filter(|path| !Profile::is_manifest_path(path))
            .collect();
        LocalSnapshot::capture(&self.fs, &self.profile, paths)
            .await
            .map_err(|e| SyncError::local(self.profile.to_vault_path(""), e))
    }

    /// Chosen content per conflicting path. Empty unless the policy is `Ask`.
    async fn resolve_conflicts(
        &self,
        conflicts: &[String],
        remote_files: &BTreeMap<String, FileRecord>,
        keys: &KeyRing,
        resolver: &dyn ConflictResolver,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        if conflicts.is_empty() {
            return Ok(BTreeMap::new());
        }
        warn!("{} conflicting file(s)", conflicts.len());
        self.events.emit(SyncEvent::ConflictsDetected {
            paths: conflicts.to_vec(),
        });
        if self.options.conflict_policy != ConflictPolicy::Ask {
            return Ok(BTreeMap::new());
        }

        let files = conflict::collect_conflicts(
            conflicts,
            remote_files,
            &self.fs,
            &self.remote,
            keys.key(),
            &self.profile,
        )
        .await?;
        let mut resolved: BTreeMap<String, Vec<u8>> = resolver
            .resolve(files)
            .await
            .into_iter()
            .map(|r| (r.path, r.content))
            .collect();

        if let Some(missing) = conflicts.iter().find(|p| !resolved.contains_key(*p)) {
            return Err(SyncError::UnresolvedConflict(missing.clone()));
        }
        resolved.retain(|path, _| conflicts.contains(path));
        Ok(resolved)
    }

    /// Apply one action. Returns `false` when there was nothing to do.
    async fn apply_action(
        &self,
        action: &SyncAction,
        store: &mut MetadataStore,
        keys: &KeyRing,
        session: &ManifestSession,
        resolved: Option<&Vec<u8>>,
    ) -> Result<bool> {
        let remote_record = session.manifest.files.get(&action.path);
        debug!("{} {}", action.kind, action.path);
        match action.kind {
            ActionKind::Upload => {
                self.upload(&action.path, store, keys, &session.folder_id, remote_record, resolved)
                    .await
            }
            ActionKind::Download => match remote_record {
                // Taking the remote side of a deletion means deleting locally
                Some(record) if record.is_tombstoned() => {
                    self.delete_local(&action.path, store).await
                }
                Some(record) => self.download(&action.path, store, keys, record).await,
                None => {
                    warn!("No remote record for {}, skipping download", action.path);
                    Ok(false)
                }
            },
            ActionKind::DeleteLocal => self.delete_local(&action.path, store).await,
            ActionKind::DeleteRemote => self.delete_remote(&action.path, store, remote_record).await,
        }
    }

    async fn upload(
        &self,
        path: &str,
        store: &mut MetadataStore,
        keys: &KeyRing,
        folder_id: &str,
        remote_record: Option<&FileRecord>,
        resolved: Option<&Vec<u8>>,
    ) -> Result<bool> {
        let plaintext = match resolved {
            Some(content) => content.clone(),
            None => {
                let vault_path = self.profile.to_vault_path(path);
                match self.fs.read(&vault_path).await {
                    Ok(bytes) => bytes,
                    Err(FsError::NotFound(_)) | Err(FsError::IsDirectory(_)) => {
                        debug!("{} no longer exists locally, nothing to upload", path);
                        return Ok(false);
                    }
                    Err(e) => return Err(SyncError::local(vault_path, e)),
                }
            }
        };

        let hash = crypto::compute_content_hash(&plaintext);
        let encrypted =
            crypto::encrypt_content(&plaintext, keys.key()).map_err(|e| SyncError::crypto(path, e))?;

        let known_id = store
            .get(path)
            .and_then(|r| r.drive_file_id.clone())
            .or_else(|| remote_record.and_then(|r| r.drive_file_id.clone()));

        let updated = match known_id {
            Some(id) => match self.remote.update_file(&id, &encrypted).await {
                Ok(info) => Some(info.id),
                Err(RemoteError::NotFound(_)) => {
                    debug!("Remote object for {} is gone, creating a new one", path);
                    None
                }
                Err(e) => return Err(SyncError::remote("upload", path, e)),
            },
            None => None,
        };

        let (file_id, obfuscated_name) = match updated {
            Some(id) => (id, None),
            None => {
                let name = crypto::encrypt_filename(path, keys.key())
                    .map_err(|e| SyncError::crypto(path, e))?;
                let info = self
                    .remote
                    .upload_file(folder_id, &name, &encrypted)
                    .await
                    .map_err(|e| SyncError::remote("upload", path, e))?;
                (info.id, Some(name))
            }
        };

        store
            .record_mut_or_insert(path, now_millis())
            .mark_uploaded(hash, file_id, obfuscated_name);
        Ok(true)
    }

    async fn download(
        &self,
        path: &str,
        store: &mut MetadataStore,
        keys: &KeyRing,
        remote_record: &FileRecord,
    ) -> Result<bool> {
        let Some(file_id) = remote_record.drive_file_id.as_deref() else {
            warn!("Remote record for {} has no file id, skipping download", path);
            return Ok(false);
        };

        let encrypted = self
            .remote
            .download_file(file_id)
            .await
            .map_err(|e| SyncError::remote("download", path, e))?;
        let plaintext =
            crypto::decrypt_content(&encrypted, keys.key()).map_err(|e| SyncError::crypto(path, e))?;

        let vault_path = self.profile.to_vault_path(path);
        if let Some(parent) = parent_dir(&vault_path) {
            self.fs
                .mkdir(parent)
                .await
                .map_err(|e| SyncError::local(parent, e))?;
        }
        self.tracker.expect_engine_write(path);
        self.fs
            .write(&vault_path, &plaintext)
            .await
            .map_err(|e| SyncError::local(vault_path.as_str(), e))?;

        store
            .record_mut_or_insert(path, now_millis())
            .mark_downloaded(remote_record);
        Ok(true)
    }

    async fn delete_local(&self, path: &str, store: &mut MetadataStore) -> Result<bool> {
        let vault_path = self.profile.to_vault_path(path);
        let removed = match self.fs.delete(&vault_path).await {
            Ok(()) => true,
            Err(FsError::NotFound(_)) => false,
            Err(e) => return Err(SyncError::local(vault_path, e)),
        };
        store.tombstone(path, now_millis());
        Ok(removed)
    }

    async fn delete_remote(
        &self,
        path: &str,
        store: &mut MetadataStore,
        remote_record: Option<&FileRecord>,
    ) -> Result<bool> {
        let known_id = store
            .get(path)
            .and_then(|r| r.drive_file_id.clone())
            .or_else(|| remote_record.and_then(|r| r.drive_file_id.clone()));

        let removed = match known_id {
            Some(id) => match self.remote.delete_file(&id).await {
                Ok(()) => true,
                Err(RemoteError::NotFound(_)) => false,
                Err(e) => return Err(SyncError::remote("delete", path, e)),
            },
            None => false,
        };
        store.tombstone(path, now_millis());
        Ok(removed)
    }

    async fn write_resolutions(
        &self,
        resolutions: &BTreeMap<String, Vec<u8>>,
        store: &mut MetadataStore,
    ) -> Result<()> {
        for (path, content) in resolutions {
            let vault_path = self.profile.to_vault_path(path);
            if let Some(parent) = parent_dir(&vault_path) {
                self.fs
                    .mkdir(parent)
                    .await
                    .map_err(|e| SyncError::local(parent, e))?;
            }
            self.tracker.expect_engine_write(path);
            self.fs
                .write(&vault_path, content)
                .await
                .map_err(|e| SyncError::local(vault_path.as_str(), e))?;
            store.record_mut_or_insert(path, now_millis()).last_modified = now_millis();
        }
        Ok(())
    }
}

/// Record peers' tombstones for synced paths this replica never saw, so a
/// later local re-creation is ordered against the deletion.
fn adopt_remote_tombstones(
    remote_files: &BTreeMap<String, FileRecord>,
    store: &mut MetadataStore,
    profile: &Profile,
) {
    for (path, record) in remote_files {
        if record.is_tombstoned()
            && store.get(path).is_none()
            && !Profile::is_manifest_path(path)
            && profile.syncs_path(path)
        {
            store.upsert(path.clone(), record.clone());
        }
    }
}
