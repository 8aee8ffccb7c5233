//! bookmark-sync-core: whole-document bookmark synchronization.
//!
//! Keeps a local bookmark tree and one shared remote document consistent
//! across any number of replicas that sync independently. This crate holds
//! the engine and the collaborator traits it consumes:
//! - Deterministic item keys and the remote document model
//! - Snapshot, tombstone, merge and apply stages of a cycle
//! - `SyncOrchestrator`, which runs one cycle at a time
//! - `BookmarkTree`, `RemoteStore`, `StateStore` and `Clock` trait
//!   abstractions, with in-memory implementations for tests

pub mod apply;
pub mod clock;
pub mod events;
pub mod identity;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod remote;
pub mod replica_id;
pub mod snapshot;
pub mod store;
pub mod tombstones;
pub mod tree;

pub use apply::{ApplyError, ApplyOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{EventBus, Subscription, SyncEvent};
pub use identity::ItemKey;
pub use merge::{Action, Decision, MergeInput, MergePlan};
pub use model::{DeviceClock, Item, ItemMap, RemoteDocument, Tombstone, TombstoneMap};
pub use orchestrator::{CycleReport, SyncError, SyncOrchestrator, SyncState, TreeEvent, Trigger};
pub use remote::{MemoryRemote, RemoteError, RemoteStore};
pub use replica_id::{ReplicaId, ReplicaIdError};
pub use store::{MemoryStateStore, StateStore, StoreError};
pub use tombstones::{TombstoneStore, TOMBSTONE_TTL};
pub use tree::{BookmarkTree, InMemoryTree, NewNode, RootRole, TreeError, TreeNode, TreeSnapshot};
