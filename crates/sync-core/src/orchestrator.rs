//! Sync orchestrator: drives one cycle end to end.
//!
//! Owns the Idle/Running state. At most one cycle runs at a time; the
//! running state is held by an RAII guard, so every exit path releases it.
//!
//! A cycle:
//! 1. check configuration, then acquire Running
//! 2. fold duplicate folders together
//! 3. snapshot the local tree and load tombstones
//! 4. fetch the remote document (absent means empty)
//! 5. merge, then apply
//! 6. write the outbound document and persist the completion time

use crate::apply::{apply, reconcile_duplicate_containers, ApplyError};
use crate::clock::{Clock, SystemClock};
use crate::events::{EventBus, SyncEvent};
use crate::merge::{merge, Action, MergeInput};
use crate::model::{DeviceClock, Item, RemoteDocument, DOCUMENT_VERSION};
use crate::remote::{RemoteError, RemoteStore};
use crate::replica_id::ReplicaId;
use crate::snapshot::{build_local, build_remote};
use crate::store::{StateStore, StoreError};
use crate::tombstones::TombstoneStore;
use crate::tree::{BookmarkTree, TreeError};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("A sync is already running")]
    AlreadyRunning,

    #[error("Not configured: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(RemoteError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("State error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotConfigured(msg) => SyncError::Configuration(msg),
            other => SyncError::Transport(other),
        }
    }
}

impl From<ApplyError> for SyncError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Tree(e) => SyncError::Tree(e),
            ApplyError::Store(e) => SyncError::Store(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
}

/// What asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A user asked; errors are surfaced.
    Manual,
    /// Debounced local edits.
    Passive,
    Startup,
    Installed,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Manual => "manual",
            Trigger::Passive => "passive",
            Trigger::Startup => "startup",
            Trigger::Installed => "installed",
        };
        f.write_str(name)
    }
}

/// A change observed on the local tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Created(Item),
    Removed(Item),
    Changed(Item),
    Moved(Item),
}

/// Outcome of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
    pub merged_folders: usize,
    /// Items in the written document.
    pub published: usize,
    /// Whether the document had to be created.
    pub document_created: bool,
    pub completed_at: u64,
}

struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator<T, R, S> {
    tree: T,
    remote: R,
    store: S,
    clock: Arc<dyn Clock>,
    replica_id: ReplicaId,
    device_name: String,
    running: AtomicBool,
    events: Arc<EventBus>,
}

impl<T, R, S> SyncOrchestrator<T, R, S>
where
    T: BookmarkTree,
    R: RemoteStore,
    S: StateStore,
{
    pub fn new(
        tree: T,
        remote: R,
        store: S,
        replica_id: ReplicaId,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            remote,
            store,
            clock: Arc::new(SystemClock),
            replica_id,
            device_name: device_name.into(),
            running: AtomicBool::new(false),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn state(&self) -> SyncState {
        if self.running.load(Ordering::Acquire) {
            SyncState::Running
        } else {
            SyncState::Idle
        }
    }

    /// Run a cycle now, surfacing every error.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        self.run(Trigger::Manual).await
    }

    /// Run a cycle for an automatic trigger.
    ///
    /// Returns `None` if the cycle was skipped (already running, not
    /// configured) or failed; failures are logged, not returned.
    pub async fn sync_automatic(&self, trigger: Trigger) -> Option<CycleReport> {
        match self.run(trigger).await {
            Ok(report) => Some(report),
            Err(SyncError::AlreadyRunning) => {
                debug!("Sync already running, dropping {} trigger", trigger);
                None
            }
            Err(SyncError::Configuration(msg)) => {
                debug!("Skipping {} sync: {}", trigger, msg);
                None
            }
            Err(e) => {
                error!("Automatic {} sync failed: {}", trigger, e);
                None
            }
        }
    }

    /// Record a local tree change.
    ///
    /// Returns whether a passive cycle should be scheduled. Changes seen
    /// while a cycle runs are that cycle's own mutations and are ignored.
    pub async fn on_tree_event(&self, event: &TreeEvent) -> Result<bool> {
        if self.state() == SyncState::Running {
            debug!("Ignoring tree event during sync: {:?}", event);
            return Ok(false);
        }

        let now = self.clock.now_ms();
        match event {
            TreeEvent::Removed(item) => {
                let mut tombstones = TombstoneStore::load(&self.store, now).await?;
                tombstones.record(item, now).await?;
                debug!("Recorded tombstone for {} '{}'", item.key, item.title);
                self.events.emit(SyncEvent::TombstoneRecorded {
                    key: item.key.to_string(),
                    title: item.title.clone(),
                    timestamp: now,
                });
            }
            TreeEvent::Created(item) => {
                let mut tombstones = TombstoneStore::load(&self.store, now).await?;
                if tombstones.clear(&item.key, now).await? {
                    debug!("Cleared tombstone for recreated {}", item.key);
                }
            }
            TreeEvent::Changed(_) | TreeEvent::Moved(_) => {}
        }
        Ok(true)
    }

    async fn run(&self, trigger: Trigger) -> Result<CycleReport> {
        self.remote.check_configured()?;
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            return Err(SyncError::AlreadyRunning);
        };

        info!("Starting {} sync", trigger);
        self.events.emit(SyncEvent::CycleStarted {
            trigger: trigger.to_string(),
            timestamp: self.clock.now_ms(),
        });

        let result = match self.tree.begin_batch().await {
            Ok(()) => self.cycle(trigger).await,
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            if let Err(e) = self.tree.commit_batch().await {
                warn!("Failed to save bookmarks after failed sync: {}", e);
            }
        }

        match result {
            Ok(report) => {
                info!(
                    "Sync complete: {} created, {} deleted, {} failed",
                    report.created, report.deleted, report.failed
                );
                self.events.emit(SyncEvent::CycleCompleted {
                    created: report.created,
                    deleted: report.deleted,
                    failed: report.failed,
                    merged_folders: report.merged_folders,
                    timestamp: report.completed_at,
                });
                Ok(report)
            }
            Err(e) => {
                self.events.emit(SyncEvent::CycleFailed {
                    error: e.to_string(),
                    timestamp: self.clock.now_ms(),
                });
                Err(e)
            }
        }
    }

    /// Fetch and parse the remote document. The flag says whether it exists.
    async fn fetch(&self) -> Result<(RemoteDocument, bool)> {
        match self.remote.read().await? {
            None => {
                debug!("No remote document yet");
                Ok((RemoteDocument::empty(), false))
            }
            Some(content) => match RemoteDocument::parse(&content) {
                Ok(document) => Ok((document, true)),
                Err(e) => {
                    warn!("Remote document is malformed, treating it as empty: {}", e);
                    Ok((RemoteDocument::empty(), true))
                }
            },
        }
    }

    async fn cycle(&self, trigger: Trigger) -> Result<CycleReport> {
        let now = self.clock.now_ms();
        let mut tombstones = TombstoneStore::load(&self.store, now).await?;

        let merged_folders = reconcile_duplicate_containers(&self.tree, &mut tombstones, now).await?;
        let local = build_local(&self.tree.read_tree().await?);

        let (document, exists) = self.fetch().await?;
        let remote = build_remote(&document.items);
        let replica = self.replica_id.to_string();
        let my_last_sync = match self.store.last_sync().await? {
            Some(at) => at,
            None => document.device_last_sync(&replica).unwrap_or(0),
        };

        let effective = tombstones.effective_view(&document.tombstones, now);
        let plan = merge(MergeInput {
            local: &local,
            remote: &remote,
            tombstones: &effective,
            my_last_sync,
        });
        debug!(
            "Plan: {} create, {} delete, {} keep, {} upload",
            plan.count(Action::Create),
            plan.count(Action::Delete),
            plan.count(Action::Keep),
            plan.count(Action::Upload)
        );

        let outcome = apply(&plan, &self.tree, &mut tombstones, now).await?;
        self.tree.commit_batch().await?;

        let completed_at = self.clock.now_ms();
        let live: HashSet<_> = outcome
            .outbound
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.key.clone())
            .collect();
        let mut outbound_tombstones = tombstones.effective_view(&document.tombstones, completed_at);
        outbound_tombstones.retain(|key, _| !live.contains(key));

        let mut devices = document.devices;
        devices.insert(
            replica.clone(),
            DeviceClock {
                name: self.device_name.clone(),
                last_sync: completed_at,
            },
        );
        let published = outcome.outbound.len();
        let outbound = RemoteDocument {
            version: DOCUMENT_VERSION,
            last_sync: completed_at,
            last_sync_by: Some(replica),
            devices,
            items: outcome.outbound,
            tombstones: outbound_tombstones,
        };
        let content = outbound
            .to_json()
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        if exists {
            self.remote.update(&content).await?;
        } else {
            self.remote.create(&content).await?;
        }
        self.store.set_last_sync(completed_at).await?;

        Ok(CycleReport {
            trigger,
            created: outcome.created,
            deleted: outcome.deleted,
            failed: outcome.failed,
            merged_folders,
            published,
            document_created: !exists,
            completed_at,
        })
    }
}
