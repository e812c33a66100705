//! Progress events emitted during a sync.
//!
//! `EventBus` hands every `SyncEvent` to its subscribers; hosts use it to
//! render progress and log conflicts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::planner::ActionKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A sync attempt started for a profile.
    SyncStarted { profile: String },
    /// Conflicting paths were found and are about to be resolved.
    ConflictsDetected { paths: Vec<String> },
    /// One planned action finished.
    ActionCompleted {
        completed: usize,
        total: usize,
        kind: ActionKind,
        path: String,
    },
    /// The manifest was finalized and metadata saved.
    SyncFinished {
        profile: String,
        actions: usize,
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so callbacks may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscribers_receive_events_until_dropped() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let subscription = bus.subscribe(move |event| sink.lock().unwrap().push(event));

        bus.emit(SyncEvent::SyncStarted {
            profile: "default".into(),
        });
        drop(subscription);
        bus.emit(SyncEvent::SyncStarted {
            profile: "ignored".into(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            SyncEvent::SyncStarted {
                profile: "default".into()
            }
        );
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SyncEvent::ActionCompleted {
            completed: 1,
            total: 3,
            kind: ActionKind::Upload,
            path: "notes/a.md".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "actionCompleted");
        assert_eq!(json["kind"], "upload");
        assert_eq!(json["total"], 3);
    }
}
