//! RemoteStore trait for the shared document.
//!
//! The remote side is a single versioned blob addressed by an opaque id that
//! the implementation owns. It is read and replaced wholesale; there is no
//! server-side merge and no compare-and-swap.
//!
//! Implementations:
//! - `MemoryRemote` - For testing
//! - `GistStore` (in sync-daemon) - GitHub Gist REST API

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fail fast when the location or credentials are missing.
    fn check_configured(&self) -> Result<()>;

    /// Current document content, or `None` if there is no document yet.
    async fn read(&self) -> Result<Option<String>>;

    /// Create the document.
    async fn create(&self, content: &str) -> Result<()>;

    /// Replace the existing document.
    async fn update(&self, content: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    content: Option<String>,
    configured: bool,
    fail_reads: bool,
    fail_writes: bool,
    creates: usize,
    updates: usize,
}

/// In-memory remote document.
///
/// Clones share the same document, so several orchestrators can sync
/// against one "server".
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                configured: true,
                ..MemoryState::default()
            })),
        }
    }

    /// A remote that reports missing configuration.
    pub fn unconfigured() -> Self {
        let remote = Self::new();
        remote.lock().configured = false;
        remote
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the stored content directly.
    pub fn set_content(&self, content: impl Into<String>) {
        self.lock().content = Some(content.into());
    }

    pub fn content(&self) -> Option<String> {
        self.lock().content.clone()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// (creates, updates) performed so far.
    pub fn write_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.creates, state.updates)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn check_configured(&self) -> Result<()> {
        if self.lock().configured {
            Ok(())
        } else {
            Err(RemoteError::NotConfigured("memory remote disabled".into()))
        }
    }

    async fn read(&self) -> Result<Option<String>> {
        let state = self.lock();
        if state.fail_reads {
            return Err(RemoteError::Network("simulated read failure".into()));
        }
        Ok(state.content.clone())
    }

    async fn create(&self, content: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(RemoteError::Network("simulated write failure".into()));
        }
        state.content = Some(content.to_string());
        state.creates += 1;
        Ok(())
    }

    async fn update(&self, content: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(RemoteError::Network("simulated write failure".into()));
        }
        if state.content.is_none() {
            return Err(RemoteError::Http {
                status: 404,
                message: "document does not exist".into(),
            });
        }
        state.content = Some(content.to_string());
        state.updates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_update() {
        let remote = MemoryRemote::new();
        assert!(remote.read().await.unwrap().is_none());
        assert!(remote.update("x").await.is_err());

        remote.create("a").await.unwrap();
        remote.update("b").await.unwrap();

        assert_eq!(remote.read().await.unwrap().as_deref(), Some("b"));
        assert_eq!(remote.write_counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_clones_share_document() {
        let a = MemoryRemote::new();
        let b = a.clone();
        a.create("shared").await.unwrap();
        assert_eq!(b.content().as_deref(), Some("shared"));
    }

    #[test]
    fn test_unconfigured() {
        assert!(matches!(
            MemoryRemote::unconfigured().check_configured(),
            Err(RemoteError::NotConfigured(_))
        ));
    }
}
