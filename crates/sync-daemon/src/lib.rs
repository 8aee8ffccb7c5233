//! bookmark-sync-daemon: runs the sync engine against a JSON bookmarks file
//! and a GitHub Gist.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod daemon;
pub mod gist;
pub mod json_tree;
pub mod mock_server;
pub mod persistence;
pub mod scheduler;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Config, ConfigArgs, ConfigError};
pub use daemon::{Daemon, Orchestrator, Status};
pub use gist::GistStore;
pub use json_tree::JsonFileTree;
pub use mock_server::MockGists;
pub use persistence::{PersistedState, StateFile, StateLock};
pub use scheduler::Scheduler;
pub use watcher::{BookmarkWatcher, ChangeTracker};
