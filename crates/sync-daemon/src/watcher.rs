//! Change detection for the bookmarks file.
//!
//! `BookmarkWatcher` reports that the file may have changed; `ChangeTracker`
//! turns the new tree into item-level events by diffing it against the last
//! tree it saw.

use anyhow::Result;
use bookmark_sync_core::model::ItemMap;
use bookmark_sync_core::orchestrator::TreeEvent;
use bookmark_sync_core::snapshot::{build_local, diff_snapshots};
use bookmark_sync_core::tree::TreeNode;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce period for raw file system events.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches the directory containing the bookmarks file.
///
/// Editors and our own atomic writes replace the file rather than modify it
/// in place, so the parent directory is watched and events are filtered by
/// file name.
pub struct BookmarkWatcher {
    path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    change_rx: mpsc::UnboundedReceiver<()>,
}

impl BookmarkWatcher {
    pub fn new(path: &Path) -> Result<Self> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?;

        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    if events.iter().any(|e| e.path.file_name() == Some(file_name.as_os_str())) {
                        debug!("Bookmarks file changed");
                        // Receiver dropped means the daemon is stopping
                        let _ = change_tx.send(());
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path,
            _debouncer: debouncer,
            change_rx,
        })
    }

    /// Wait for the next change. `None` once the watcher has shut down.
    pub async fn changed(&mut self) -> Option<()> {
        self.change_rx.recv().await?;
        // Collapse a burst into one notification
        while self.change_rx.try_recv().is_ok() {}
        Some(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Last observed local snapshot, for turning whole-tree reads into events.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    baseline: ItemMap,
}

impl ChangeTracker {
    pub fn new(roots: &[TreeNode]) -> Self {
        Self::from_baseline(build_local(roots))
    }

    /// Resume from a baseline saved by an earlier run.
    pub fn from_baseline(baseline: ItemMap) -> Self {
        Self { baseline }
    }

    pub fn baseline(&self) -> &ItemMap {
        &self.baseline
    }

    /// Events since the previous observation; the new tree becomes the baseline.
    pub fn observe(&mut self, roots: &[TreeNode]) -> Vec<TreeEvent> {
        let current = build_local(roots);
        let events = diff_snapshots(&self.baseline, &current);
        self.baseline = current;
        events
    }

    /// Take the tree as the baseline without producing events, e.g. after a
    /// cycle changed it.
    pub fn reset(&mut self, roots: &[TreeNode]) {
        self.baseline = build_local(roots);
    }
}
