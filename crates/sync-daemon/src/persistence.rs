//! Per-replica state on disk.
//!
//! Stores the replica id, the last completed sync, the local tombstones, the
//! last local tree a cycle accounted for and the gist adopted on first sync in
//! `<state_dir>/state.json`. Every write goes through a temp file and a rename.
//!
//! The file is re-read on every access, so two handles on one path never
//! write back a stale copy over each other. `StateLock` keeps a second process
//! from running cycles against the same directory.

use async_trait::async_trait;
use bookmark_sync_core::model::{Item, ItemMap, TombstoneMap};
use bookmark_sync_core::replica_id::ReplicaId;
use bookmark_sync_core::store::{Result, StateStore, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

const LOCK_FILE: &str = "lock";

/// Contents of the state file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub replica_id: ReplicaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<u64>,
    #[serde(default)]
    pub tombstones: TombstoneMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gist_id: Option<String>,
    /// Local items as of the end of the last cycle or the last observed edit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Vec<Item>>,
}

impl PersistedState {
    fn fresh() -> Self {
        Self {
            replica_id: ReplicaId::generate(),
            last_sync: None,
            tombstones: TombstoneMap::new(),
            gist_id: None,
            baseline: None,
        }
    }
}

fn io(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", path.display(), e))
}

/// Exclusive claim on a state directory, released when dropped.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
}

impl StateLock {
    /// Take the lock, or `None` if another handle already holds it.
    pub fn try_acquire(state_dir: &Path) -> Result<Option<Self>> {
        fs::create_dir_all(state_dir).map_err(|e| io(state_dir, e))?;
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            debug!("{} is held by another process", path.display());
            return Ok(None);
        }
        Ok(Some(Self { _file: file }))
    }
}

/// Handle on the state file.
pub struct StateFile {
    path: PathBuf,
    replica_id: ReplicaId,
    /// Serializes read-modify-write within this process
    write: Mutex<()>,
}

impl StateFile {
    /// Open the state file, creating it with a new replica id if absent.
    ///
    /// The flag is `true` when the file was just created, i.e. this is the
    /// first run of this replica.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, bool)> {
        let path = path.into();
        let (state, fresh) = match read_state(&path)? {
            Some(state) => (state, false),
            None => {
                let state = PersistedState::fresh();
                info!("Created replica {}", state.replica_id);
                write_atomic(&path, &state)?;
                (state, true)
            }
        };

        Ok((
            Self {
                path,
                replica_id: state.replica_id,
                write: Mutex::new(()),
            },
            fresh,
        ))
    }

    /// Read the state file without creating it.
    pub fn read(path: &Path) -> Result<Option<PersistedState>> {
        read_state(path)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn gist_id(&self) -> Result<Option<String>> {
        Ok(self.current()?.gist_id)
    }

    /// Remember the gist in use. No write if it is unchanged.
    pub fn set_gist_id(&self, gist_id: &str) -> Result<()> {
        self.update(|state| {
            if state.gist_id.as_deref() == Some(gist_id) {
                return false;
            }
            state.gist_id = Some(gist_id.to_string());
            true
        })
    }

    /// The saved baseline, or `None` if no cycle or edit has recorded one.
    pub fn baseline(&self) -> Result<Option<ItemMap>> {
        Ok(self.current()?.baseline.map(|items| {
            items
                .into_iter()
                .map(|item| (item.key.clone(), item))
                .collect()
        }))
    }

    pub fn set_baseline(&self, items: &ItemMap) -> Result<()> {
        let mut sorted: Vec<Item> = items.values().cloned().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));
        self.update(|state| {
            if state.baseline.as_ref() == Some(&sorted) {
                return false;
            }
            state.baseline = Some(sorted);
            true
        })
    }

    /// The contents as they are on disk now.
    fn current(&self) -> Result<PersistedState> {
        Ok(read_state(&self.path)?.unwrap_or_else(|| PersistedState {
            replica_id: self.replica_id,
            ..PersistedState::fresh()
        }))
    }

    /// Re-read the file, apply `change` and write it back if it reports a
    /// change.
    fn update(&self, change: impl FnOnce(&mut PersistedState) -> bool) -> Result<()> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = self.current()?;
        if !change(&mut next) {
            return Ok(());
        }
        write_atomic(&self.path, &next)
    }
}

fn read_state(path: &Path) -> Result<Option<PersistedState>> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io(path, e)),
    }
}

fn write_atomic(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io(parent, e))?;
        }
    }
    let json =
        serde_json::to_string_pretty(state).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io(path, e))
}

#[async_trait]
impl StateStore for StateFile {
    async fn load_tombstones(&self) -> Result<TombstoneMap> {
        Ok(self.current()?.tombstones)
    }

    async fn save_tombstones(&self, tombstones: &TombstoneMap) -> Result<()> {
        self.update(|state| {
            if &state.tombstones == tombstones {
                return false;
            }
            state.tombstones = tombstones.clone();
            true
        })
    }

    async fn last_sync(&self) -> Result<Option<u64>> {
        Ok(self.current()?.last_sync)
    }

    async fn set_last_sync(&self, at: u64) -> Result<()> {
        self.update(|state| {
            state.last_sync = Some(at);
            true
        })
    }
}
