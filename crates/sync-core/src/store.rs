//! StateStore trait for durable per-replica sync state.
//!
//! Holds what must survive restarts but never leaves this replica:
//! the local tombstones and the completion time of the last cycle.

use crate::model::TombstoneMap;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt state: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_tombstones(&self) -> Result<TombstoneMap>;

    async fn save_tombstones(&self, tombstones: &TombstoneMap) -> Result<()>;

    /// Completion time of the last successful cycle, if any.
    async fn last_sync(&self) -> Result<Option<u64>>;

    async fn set_last_sync(&self, at: u64) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    tombstones: TombstoneMap,
    last_sync: Option<u64>,
}

/// In-memory state store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tombstones(&self) -> TombstoneMap {
        self.lock().tombstones.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_tombstones(&self) -> Result<TombstoneMap> {
        Ok(self.lock().tombstones.clone())
    }

    async fn save_tombstones(&self, tombstones: &TombstoneMap) -> Result<()> {
        self.lock().tombstones = tombstones.clone();
        Ok(())
    }

    async fn last_sync(&self) -> Result<Option<u64>> {
        Ok(self.lock().last_sync)
    }

    async fn set_last_sync(&self, at: u64) -> Result<()> {
        self.lock().last_sync = Some(at);
        Ok(())
    }
}
