//! Sync cycle events and a small callback bus for monitoring.
//!
//! The daemon subscribes to log cycle outcomes; tests subscribe to assert
//! on them. Wrap the bus in `Arc` to subscribe.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A cycle acquired the running state.
    CycleStarted {
        /// What asked for the cycle ("manual", "passive", ...).
        trigger: String,
        timestamp: u64,
    },
    /// A cycle wrote the remote document.
    #[serde(rename_all = "camelCase")]
    CycleCompleted {
        created: usize,
        deleted: usize,
        failed: usize,
        /// Duplicate folders folded together before the merge.
        merged_folders: usize,
        timestamp: u64,
    },
    /// A cycle aborted.
    CycleFailed { error: String, timestamp: u64 },
    /// A local removal was recorded as a tombstone.
    TombstoneRecorded {
        key: String,
        title: String,
        timestamp: u64,
    },
}

/// Unsubscribes when dropped. Hold it for as long as events are wanted.
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

#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

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
        // try_write: Drop may run while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
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
