//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini and reports vault-relative paths as
//! [`LocalEvent`]s for the sync engines.

use anyhow::Result;
use drive_sync_core::LocalEvent;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

const DEBOUNCE: Duration = Duration::from_millis(200);

/// What the watcher has already seen, keyed by vault-relative path.
#[derive(Default)]
struct SeenPaths {
    /// Last seen mtime, to filter spurious events (Docker volume bug workaround)
    mtimes: HashMap<String, SystemTime>,
    /// Directories, so their removal is not reported as a file deletion
    dirs: HashSet<String>,
}

type SeenCache = Arc<Mutex<SeenPaths>>;

/// File watcher that monitors the vault directory.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<LocalEvent>,
}

impl FileWatcher {
    /// Watch `vault_path` recursively, skipping anything under `ignored`
    /// (vault-relative directory prefixes such as the engines' state dirs).
    pub fn new(vault_path: PathBuf, ignored: Vec<String>) -> Result<Self> {
        // FSEvents on macOS needs the real path (/var -> /private/var)
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = vault_path.clone();
        let seen: SeenCache = Arc::new(Mutex::new(SeenPaths::default()));

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(local) = Self::process_path(&event.path, &root, &ignored, &seen)
                        {
                            if event_tx.send(local).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn a changed path into a `LocalEvent`, or `None` if it is not relevant.
    ///
    /// The debouncer does not say what happened, so the path is inspected:
    /// a missing path is a deletion, a path never seen before is a creation.
    fn process_path(
        path: &Path,
        vault_path: &Path,
        ignored: &[String],
        seen: &SeenCache,
    ) -> Option<LocalEvent> {
        let relative = relative_path(path, vault_path)?;
        if is_ignored(&relative, ignored) {
            return None;
        }

        let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());

        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => {
                if seen.dirs.remove(&relative) {
                    return None;
                }
                seen.mtimes.remove(&relative);
                debug!("File event: deleted {}", relative);
                return Some(LocalEvent::Deleted(relative));
            }
        };

        if metadata.is_dir() {
            seen.dirs.insert(relative);
            return None;
        }

        let mtime = metadata.modified().ok();
        let event = match (seen.mtimes.get(&relative), mtime) {
            (Some(last), Some(mtime)) if *last == mtime => {
                // Mtime unchanged - spurious event
                return None;
            }
            (Some(_), _) => LocalEvent::Modified(relative.clone()),
            (None, _) => LocalEvent::Created(relative.clone()),
        };
        if let Some(mtime) = mtime {
            seen.mtimes.insert(relative, mtime);
        }

        debug!("File event: {:?}", event);
        Some(event)
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<LocalEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

/// Vault-relative path with `/` separators.
fn relative_path(path: &Path, vault_path: &Path) -> Option<String> {
    let relative = path.strip_prefix(vault_path).ok()?;
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_ignored(relative: &str, ignored: &[String]) -> bool {
    ignored.iter().any(|prefix| {
        let prefix = prefix.trim_matches('/');
        relative == prefix || relative.starts_with(&format!("{}/", prefix))
    })
}
