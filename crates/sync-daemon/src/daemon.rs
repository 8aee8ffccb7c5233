//! Wiring of the engine to its daemon collaborators, and the main loop.
//!
//! A `Daemon` holds the state directory lock for its whole life, so a manual
//! `sync` and a running daemon never cycle against the same replica at once.
//! The local tree as of the last cycle is saved with the state, so edits made
//! while no daemon was running still turn into tombstones on the next start.

use anyhow::{anyhow, Result};
use bookmark_sync_core::events::Subscription;
use bookmark_sync_core::orchestrator::{CycleReport, SyncError, SyncOrchestrator, Trigger};
use bookmark_sync_core::replica_id::ReplicaId;
use bookmark_sync_core::snapshot::build_local;
use bookmark_sync_core::tree::BookmarkTree;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gist::GistStore;
use crate::json_tree::JsonFileTree;
use crate::persistence::{StateFile, StateLock};
use crate::scheduler::{Scheduler, STARTUP_GRACE};
use crate::watcher::{BookmarkWatcher, ChangeTracker};

pub type Orchestrator = SyncOrchestrator<JsonFileTree, GistStore, StateFile>;

/// What `status` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub replica_id: ReplicaId,
    pub device_name: String,
    pub last_sync: Option<u64>,
    pub tombstones: usize,
    pub gist_id: Option<String>,
    pub bookmarks: usize,
}

impl Status {
    /// Read a replica's state without taking the lock, so this works next to
    /// a running daemon.
    pub async fn load(config: &Config) -> Result<Self> {
        let path = config.state_file();
        let state = StateFile::read(&path)?
            .ok_or_else(|| anyhow!("No replica state at {}", path.display()))?;
        let roots = JsonFileTree::new(&config.bookmarks_file).read_tree().await?;
        Ok(Self {
            replica_id: state.replica_id,
            device_name: config.device_name.clone(),
            last_sync: state.last_sync,
            tombstones: state.tombstones.len(),
            gist_id: config.gist_id.clone().or(state.gist_id),
            bookmarks: build_local(&roots).len(),
        })
    }
}

pub struct Daemon {
    orchestrator: Orchestrator,
    config: Config,
    /// The state file was created by this process
    first_run: bool,
    tracker: Mutex<ChangeTracker>,
    _lock: StateLock,
}

impl Daemon {
    /// Lock the state directory and open the state and bookmarks files,
    /// creating both if needed.
    ///
    /// Fails with `SyncError::AlreadyRunning` while another daemon or sync
    /// holds the state directory.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let lock = StateLock::try_acquire(&config.state_dir)?.ok_or(SyncError::AlreadyRunning)?;

        let (state, first_run) = StateFile::open(config.state_file())?;
        let gist_id = match &config.gist_id {
            Some(id) => Some(id.clone()),
            None => state.gist_id()?,
        };
        let remote = GistStore::new(&config.api_url, config.token.clone(), gist_id)?
            .with_gist_creation(config.create_gist);

        let tree = JsonFileTree::new(&config.bookmarks_file);
        tree.ensure_exists().await?;
        let tracker = match state.baseline()? {
            Some(baseline) => ChangeTracker::from_baseline(baseline),
            None => ChangeTracker::new(&tree.read_tree().await?),
        };

        let replica_id = state.replica_id();
        let orchestrator =
            SyncOrchestrator::new(tree, remote, state, replica_id, config.device_name.clone());

        Ok(Self {
            orchestrator,
            config,
            first_run,
            tracker: Mutex::new(tracker),
            _lock: lock,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn first_run(&self) -> bool {
        self.first_run
    }

    /// Record pending local edits, then run one cycle, surfacing errors.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        self.catch_up().await?;
        let report = self.orchestrator.sync_now().await;
        self.remember_gist();
        self.settle().await;
        Ok(report?)
    }

    fn tracker(&self) -> MutexGuard<'_, ChangeTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Turn edits since the last observation into tree events, including
    /// edits made while no daemon was running. Returns whether they want a
    /// sync.
    async fn catch_up(&self) -> Result<bool> {
        let roots = self.orchestrator.tree().read_tree().await?;
        let (events, baseline) = {
            let mut tracker = self.tracker();
            let events = tracker.observe(&roots);
            (events, tracker.baseline().clone())
        };
        if events.is_empty() {
            return Ok(false);
        }

        let mut wants_sync = false;
        let mut recorded = true;
        for event in &events {
            match self.orchestrator.on_tree_event(event).await {
                Ok(schedule) => wants_sync |= schedule,
                Err(e) => {
                    warn!("Failed to record {:?}: {}", event, e);
                    recorded = false;
                }
            }
        }
        // Keep the old baseline on disk so a restart retries what failed
        if recorded {
            self.orchestrator.store().set_baseline(&baseline)?;
        }
        Ok(wants_sync)
    }

    /// Take the tree as a cycle left it as the new baseline. The cycle's own
    /// writes are not local edits.
    async fn settle(&self) {
        let roots = match self.orchestrator.tree().read_tree().await {
            Ok(roots) => roots,
            Err(e) => {
                warn!("Failed to read bookmarks after sync: {}", e);
                return;
            }
        };
        let baseline = {
            let mut tracker = self.tracker();
            tracker.reset(&roots);
            tracker.baseline().clone()
        };
        if let Err(e) = self.orchestrator.store().set_baseline(&baseline) {
            warn!("Failed to save bookmark baseline: {}", e);
        }
    }

    /// Persist a gist adopted by the transport so restarts keep using it.
    fn remember_gist(&self) {
        if let Some(id) = self.orchestrator.remote().gist_id() {
            if let Err(e) = self.orchestrator.store().set_gist_id(&id) {
                warn!("Failed to save gist id {}: {}", id, e);
            }
        }
    }

    fn log_events(&self) -> Subscription {
        self.orchestrator.events().subscribe(|event| {
            if let Ok(json) = serde_json::to_string(&event) {
                debug!("Sync event: {}", json);
            }
        })
    }

    /// Watch the bookmarks file and sync until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let _events = self.log_events();
        let mut watcher = BookmarkWatcher::new(self.orchestrator.tree().path())?;
        let mut scheduler = Scheduler::new();
        info!("Watching {}", watcher.path().display());

        if self.config.sync_on_startup {
            let trigger = if self.first_run {
                Trigger::Installed
            } else {
                Trigger::Startup
            };
            scheduler.schedule(trigger, STARTUP_GRACE);
        }
        // Edits made while the daemon was stopped
        self.on_file_changed(&mut scheduler).await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                changed = watcher.changed() => {
                    if changed.is_none() {
                        warn!("File watcher stopped");
                        break;
                    }
                    self.on_file_changed(&mut scheduler).await;
                }

                trigger = scheduler.wait() => {
                    self.run_cycle(trigger).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn on_file_changed(&self, scheduler: &mut Scheduler) {
        match self.catch_up().await {
            Ok(true) if self.config.auto_sync => {
                debug!("Local changes, sync scheduled");
                scheduler.schedule_passive();
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read bookmarks: {}", e),
        }
    }

    async fn run_cycle(&self, trigger: Trigger) {
        if let Some(report) = self.orchestrator.sync_automatic(trigger).await {
            debug!("Published {} items", report.published);
        }
        self.remember_gist();
        self.settle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            bookmarks_file: dir.path().join("bookmarks.json"),
            state_dir: dir.path().join("state"),
            token: None,
            gist_id: None,
            create_gist: false,
            api_url: "http://127.0.0.1:9".into(),
            device_name: "test".into(),
            auto_sync: true,
            sync_on_startup: false,
        }
    }

    #[tokio::test]
    async fn test_open_creates_files_and_reports_first_run() {
        let dir = TempDir::new().unwrap();

        let daemon = Daemon::open(config(&dir)).await.unwrap();
        assert!(daemon.first_run());
        assert!(dir.path().join("bookmarks.json").exists());
        assert!(dir.path().join("state").join("state.json").exists());
        let replica = daemon.orchestrator().replica_id();
        drop(daemon);

        let daemon = Daemon::open(config(&dir)).await.unwrap();
        assert!(!daemon.first_run());
        assert_eq!(daemon.orchestrator().replica_id(), replica);
    }

    #[tokio::test]
    async fn test_second_open_of_a_state_dir_is_already_running() {
        let dir = TempDir::new().unwrap();
        let running = Daemon::open(config(&dir)).await.unwrap();

        let err = Daemon::open(config(&dir)).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::AlreadyRunning)
        ));

        drop(running);
        assert!(Daemon::open(config(&dir)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sync_without_token_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::open(config(&dir)).await.unwrap();

        let err = daemon.sync_now().await.unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[tokio::test]
    async fn test_sync_without_gist_id_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.token = Some("t".into());
        let daemon = Daemon::open(config).await.unwrap();

        let err = daemon.sync_now().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Configuration(message)) if message.contains("gist id")
        ));
    }

    #[tokio::test]
    async fn test_status_of_fresh_replica() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::open(config(&dir)).await.unwrap();

        // Readable while the daemon holds the lock
        let status = Status::load(&config(&dir)).await.unwrap();
        assert_eq!(status.last_sync, None);
        assert_eq!(status.tombstones, 0);
        assert_eq!(status.bookmarks, 0);
        assert_eq!(status.gist_id, None);
        assert_eq!(status.device_name, "test");
        assert_eq!(status.replica_id, daemon.orchestrator().replica_id());
    }

    #[tokio::test]
    async fn test_status_without_state_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Status::load(&config(&dir)).await.is_err());
        assert!(!dir.path().join("state").exists());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut bad = config(&dir);
        bad.api_url = "gist.github.com".into();

        assert!(Daemon::open(bad).await.is_err());
    }
}
