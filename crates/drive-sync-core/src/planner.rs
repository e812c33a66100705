//! Turns two metadata views into an ordered action list.
//!
//! Planning is pure: the caller supplies the remote manifest's records, the
//! local store's records, a [`LocalSnapshot`] of actual on-disk hashes and the
//! already-detected conflict paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conflict::ConflictPolicy;
use crate::metadata::FileRecord;
use crate::profile::Profile;
use crate::snapshot::LocalSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::DeleteLocal => "delete_local",
            ActionKind::DeleteRemote => "delete_remote",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAction {
    pub kind: ActionKind,
    pub path: String,
}

impl SyncAction {
    pub fn new(kind: ActionKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Actions for conflicting paths under a policy.
///
/// `Ask` plans uploads: the resolver's chosen content is what gets uploaded.
pub fn conflict_actions(conflict_paths: &[String], policy: ConflictPolicy) -> Vec<SyncAction> {
    let kind = match policy {
        ConflictPolicy::Ask | ConflictPolicy::KeepLocal => ActionKind::Upload,
        ConflictPolicy::KeepRemote => ActionKind::Download,
    };
    conflict_paths
        .iter()
        .map(|path| SyncAction::new(kind, path.clone()))
        .collect()
}

/// Plan a full sync: conflict actions first, then the ordinary diff in
/// meta-path order.
pub fn plan_sync(
    remote: &BTreeMap<String, FileRecord>,
    local: &BTreeMap<String, FileRecord>,
    snapshot: &LocalSnapshot,
    conflict_paths: &[String],
    policy: ConflictPolicy,
) -> Vec<SyncAction> {
    let conflicts: BTreeSet<&str> = conflict_paths.iter().map(String::as_str).collect();
    let mut actions = conflict_actions(conflict_paths, policy);

    let paths: BTreeSet<&String> = remote.keys().chain(local.keys()).collect();
    for path in paths {
        if Profile::is_manifest_path(path) || conflicts.contains(path.as_str()) {
            continue;
        }
        let kind = match (remote.get(path), local.get(path)) {
            (Some(r), Some(l)) => diff_common(r, l, snapshot.actual_hash(path)),
            (Some(r), None) => (!r.is_tombstoned()).then_some(ActionKind::Download),
            (None, Some(l)) => (!l.is_tombstoned()).then_some(ActionKind::Upload),
            (None, None) => None,
        };
        if let Some(kind) = kind {
            actions.push(SyncAction::new(kind, path.clone()));
        }
    }
    actions
}

fn diff_common(remote: &FileRecord, local: &FileRecord, actual: Option<&str>) -> Option<ActionKind> {
    if remote.is_tombstoned() && local.is_tombstoned() {
        return None;
    }
    if remote.live_hash() == actual {
        return None;
    }

    if remote.is_tombstoned() {
        // Equal timestamps: the deletion wins
        let deleted_at = remote.deleted_at.unwrap_or(0);
        return if local.last_modified > deleted_at {
            Some(ActionKind::Upload)
        } else {
            Some(ActionKind::DeleteLocal)
        };
    }

    if local.is_tombstoned() {
        let deleted_at = local.deleted_at.unwrap_or(0);
        return if remote.last_modified > deleted_at {
            Some(ActionKind::Download)
        } else {
            Some(ActionKind::DeleteRemote)
        };
    }

    if actual != local.content_hash.as_deref() {
        Some(ActionKind::Upload)
    } else {
        Some(ActionKind::Download)
    }
}

/// Drop actions under the host config directory unless the profile syncs it.
/// The manifest path is always kept.
pub fn filter_config_actions(actions: Vec<SyncAction>, profile: &Profile) -> Vec<SyncAction> {
    if profile.include_config_dir {
        return actions;
    }
    actions
        .into_iter()
        .filter(|a| Profile::is_manifest_path(&a.path) || profile.syncs_path(&a.path))
        .collect()
}
