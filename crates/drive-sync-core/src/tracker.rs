//! Applies local file events to a profile's metadata store.
//!
//! The engine's own downloads also show up as file events. Before writing, the
//! engine registers the write with [`ChangeTracker::expect_engine_write`]; the
//! next event for that path is then consumed as an echo instead of being
//! recorded as a user edit. Pending writes are counted per path, so two
//! downloads in a row expect two echoes, and expire after [`ECHO_TTL`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, trace};
use web_time::Instant;

use crate::fs::{walk_files, FileSystem, FsError};
use crate::metadata::MetadataStore;
use crate::profile::Profile;

/// How long an expected engine write waits for its echo event.
pub const ECHO_TTL: Duration = Duration::from_secs(5);

/// A change reported by the host's file watcher. Paths are vault paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
}

#[derive(Debug, Clone, Copy)]
struct PendingWrites {
    count: u32,
    since: Instant,
}

pub struct ChangeTracker {
    profile: Profile,
    pending: Mutex<HashMap<String, PendingWrites>>,
    ttl: Duration,
}

impl ChangeTracker {
    pub fn new(profile: Profile) -> Self {
        Self::with_ttl(profile, ECHO_TTL)
    }

    pub fn with_ttl(profile: Profile, ttl: Duration) -> Self {
        Self {
            profile,
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Meta-path for a vault path this profile syncs.
    fn tracked_meta_path(&self, vault_path: &str) -> Option<String> {
        self.profile
            .to_meta_path(vault_path)
            .filter(|meta_path| self.profile.syncs_path(meta_path))
    }

    /// Register a write the engine is about to make to `meta_path`.
    pub fn expect_engine_write(&self, meta_path: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let entry = pending.entry(meta_path.to_string()).or_insert(PendingWrites {
            count: 0,
            since: Instant::now(),
        });
        entry.count += 1;
        entry.since = Instant::now();
    }

    /// Consume one pending engine write for `meta_path`, if any is still live.
    fn consume_echo(&self, meta_path: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = pending.get_mut(meta_path) else {
            return false;
        };
        if entry.since.elapsed() >= self.ttl {
            pending.remove(meta_path);
            return false;
        }
        entry.count -= 1;
        if entry.count == 0 {
            pending.remove(meta_path);
        }
        true
    }

    /// Number of live pending engine writes for a meta-path.
    pub fn pending_writes(&self, meta_path: &str) -> u32 {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .get(meta_path)
            .filter(|p| p.since.elapsed() < self.ttl)
            .map_or(0, |p| p.count)
    }

    /// Restart the TTL of every pending write, including ones that lapsed.
    pub fn refresh_pending(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for entry in pending.values_mut() {
            entry.since = now;
        }
    }

    /// Drop expired pending writes.
    pub fn cleanup_expired(&self) {
        let ttl = self.ttl;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, p| p.since.elapsed() < ttl);
    }

    pub fn on_create(&self, store: &mut MetadataStore, vault_path: &str, now: u64) {
        self.on_modify(store, vault_path, now);
    }

    pub fn on_modify(&self, store: &mut MetadataStore, vault_path: &str, now: u64) {
        let Some(meta_path) = self.tracked_meta_path(vault_path) else {
            return;
        };

        if self.consume_echo(&meta_path) {
            trace!("Ignoring echo of engine write: {}", meta_path);
            if let Some(record) = store.get_mut(&meta_path) {
                record.just_downloaded = false;
            }
            return;
        }

        debug!("Local edit: {}", meta_path);
        store.record_mut_or_insert(&meta_path, now).mark_edited(now);
    }

    pub fn on_delete(&self, store: &mut MetadataStore, vault_path: &str, now: u64) {
        let Some(meta_path) = self.tracked_meta_path(vault_path) else {
            return;
        };
        debug!("Local delete: {}", meta_path);
        store.tombstone(&meta_path, now);
    }

    pub fn on_rename(&self, store: &mut MetadataStore, from: &str, to: &str, now: u64) {
        self.on_delete(store, from, now);
        self.on_create(store, to, now);
    }

    pub fn apply(&self, store: &mut MetadataStore, event: &LocalEvent, now: u64) {
        match event {
            LocalEvent::Created(path) => self.on_create(store, path, now),
            LocalEvent::Modified(path) => self.on_modify(store, path, now),
            LocalEvent::Deleted(path) => self.on_delete(store, path, now),
            LocalEvent::Renamed { from, to } => self.on_rename(store, from, to, now),
        }
    }

    /// Create records for files in the profile folder the store has never seen.
    ///
    /// Returns how many records were created.
    pub async fn initial_scan<F: FileSystem + ?Sized>(
        &self,
        fs: &F,
        store: &mut MetadataStore,
        now: u64,
    ) -> Result<usize, FsError> {
        let root = self.profile.to_vault_path("");
        let mut created = 0;
        for vault_path in walk_files(fs, &root).await? {
            let Some(meta_path) = self.tracked_meta_path(&vault_path) else {
                continue;
            };
            if store.get(&meta_path).is_none() {
                store.record_mut_or_insert(&meta_path, now);
                created += 1;
            }
        }
        if created > 0 {
            debug!("Initial scan found {} new files", created);
        }
        Ok(created)
    }
}
