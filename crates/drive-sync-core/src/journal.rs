//! Recovery journal for interrupted syncs.
//!
//! A sync applies actions one by one and only publishes the manifest at the
//! end. If it stops in between, completed uploads have moved the local stored
//! hash forward while the remote manifest still describes the old content; the
//! next plan would then read the difference as a remote change and download
//! over the local edit. The journal remembers each upload's previous hash so
//! recovery can roll it back and let the planner re-upload.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fs::{FileSystem, FsError};
use crate::metadata::{MetadataError, MetadataStore, Result};
use crate::planner::{ActionKind, SyncAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub action: SyncAction,
    /// Stored hash before the action ran
    #[serde(default)]
    pub previous_hash: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journal {
    pub started_at: u64,
    pub entries: Vec<JournalEntry>,
}

impl Journal {
    /// Journal for a plan about to be applied against `store`.
    pub fn begin(actions: &[SyncAction], store: &MetadataStore, now: u64) -> Self {
        let entries = actions
            .iter()
            .map(|action| JournalEntry {
                action: action.clone(),
                previous_hash: store.get(&action.path).and_then(|r| r.content_hash.clone()),
                completed: false,
            })
            .collect();
        Self {
            started_at: now,
            entries,
        }
    }

    pub fn mark_completed(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.completed = true;
        }
    }

    pub fn completed(&self) -> usize {
        self.entries.iter().filter(|e| e.completed).count()
    }

    /// Roll back completed uploads so the next plan uploads them again.
    ///
    /// Returns the number of records rolled back.
    pub fn recover(&self, store: &mut MetadataStore) -> usize {
        let mut rolled_back = 0;
        for entry in self.entries.iter().filter(|e| e.completed) {
            if entry.action.kind != ActionKind::Upload {
                continue;
            }
            if let Some(record) = store.get_mut(&entry.action.path) {
                record.content_hash = entry.previous_hash.clone();
                record.dirty = true;
                rolled_back += 1;
            }
        }
        rolled_back
    }

    pub async fn load<F: FileSystem + ?Sized>(fs: &F, path: &str) -> Result<Option<Self>> {
        if !fs.exists(path).await? {
            return Ok(None);
        }
        let bytes = fs.read(path).await?;
        match serde_json::from_slice(&bytes) {
            Ok(journal) => Ok(Some(journal)),
            Err(e) => {
                // Unreadable journal: nothing to recover, start clean
                warn!("Discarding unreadable sync journal {}: {}", path, e);
                Ok(None)
            }
        }
    }

    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F, path: &str) -> Result<()> {
        let contents = serde_json::to_vec_pretty(self)
            .map_err(|e| MetadataError::Serialization(e.to_string()))?;
        fs.write(path, &contents).await?;
        Ok(())
    }

    pub async fn clear<F: FileSystem + ?Sized>(fs: &F, path: &str) -> Result<()> {
        match fs.delete(path).await {
            Ok(()) | Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Replay a leftover journal into the store and remove it.
pub async fn recover_interrupted<F: FileSystem + ?Sized>(
    fs: &F,
    path: &str,
    store: &mut MetadataStore,
) -> Result<Option<usize>> {
    let journal = Journal::load(fs, path).await?;
    Journal::clear(fs, path).await?;
    let Some(journal) = journal else {
        return Ok(None);
    };

    let rolled_back = journal.recover(store);
    info!(
        "Recovered interrupted sync ({}/{} actions completed, {} upload(s) to redo)",
        journal.completed(),
        journal.entries.len(),
        rolled_back
    );
    Ok(Some(rolled_back))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::metadata::FileRecord;

    fn synced(hash: &str) -> FileRecord {
        let mut record = FileRecord::observed(1);
        record.mark_uploaded(hash.into(), format!("id-{}", hash), None);
        record
    }

    #[test]
    fn test_recover_rolls_back_completed_uploads_only() {
        let mut store = MetadataStore::new();
        store.upsert("a.md", synced("old-a"));
        store.upsert("b.md", synced("old-b"));
        store.upsert("c.md", synced("remote-c"));

        let actions = vec![
            SyncAction::new(ActionKind::Upload, "a.md"),
            SyncAction::new(ActionKind::Upload, "b.md"),
            SyncAction::new(ActionKind::Download, "c.md"),
        ];
        let mut journal = Journal::begin(&actions, &store, 10);

        // a.md uploaded and c.md downloaded before the interruption
        store.get_mut("a.md").unwrap().mark_uploaded("new-a".into(), "id-old-a".into(), None);
        journal.mark_completed(0);
        journal.mark_completed(2);

        assert_eq!(journal.recover(&mut store), 1);
        let a = store.get("a.md").unwrap();
        assert_eq!(a.content_hash.as_deref(), Some("old-a"));
        assert_eq!(a.drive_file_id.as_deref(), Some("id-old-a"));
        assert!(a.dirty);
        assert!(!store.get("b.md").unwrap().dirty);
    }

    #[tokio::test]
    async fn test_journal_lifecycle_on_disk() {
        let fs = InMemoryFs::new();
        let path = ".obsidian/plugins/drive-sync/default/journal.json";
        let mut store = MetadataStore::new();
        store.upsert("new.md", FileRecord::observed(1));

        assert!(recover_interrupted(&fs, path, &mut store).await.unwrap().is_none());

        let mut journal = Journal::begin(&[SyncAction::new(ActionKind::Upload, "new.md")], &store, 5);
        journal.save(&fs, path).await.unwrap();
        store.get_mut("new.md").unwrap().mark_uploaded("h".into(), "id-1".into(), None);
        journal.mark_completed(0);
        journal.save(&fs, path).await.unwrap();

        let loaded = Journal::load(&fs, path).await.unwrap().unwrap();
        assert_eq!(loaded, journal);

        assert_eq!(recover_interrupted(&fs, path, &mut store).await.unwrap(), Some(1));
        assert!(!fs.exists(path).await.unwrap());
        // Never-synced file keeps its remote id but loses the hash
        let record = store.get("new.md").unwrap();
        assert_eq!(record.content_hash, None);
        assert_eq!(record.drive_file_id.as_deref(), Some("id-1"));
    }

    #[tokio::test]
    async fn test_unreadable_journal_is_discarded() {
        let fs = InMemoryFs::new();
        fs.write("journal.json", b"garbage").await.unwrap();
        assert!(Journal::load(&fs, "journal.json").await.unwrap().is_none());
        Journal::clear(&fs, "journal.json").await.unwrap();
        Journal::clear(&fs, "journal.json").await.unwrap();
    }
}
