//! Bookmark tree backed by a JSON file on disk.
//!
//! The file holds a `TreeSnapshot`. The parsed tree is kept in memory and
//! reloaded only when the file's size or modification time changes, so edits
//! by anyone else are still picked up. Mutations write the file back with
//! write-to-temp then rename, so a reader (or the watcher) never sees a
//! half-written file. Inside a batch they are written once, at commit. A
//! missing file reads as a tree with only the two permanent roots.

use async_trait::async_trait;
use bookmark_sync_core::clock::{Clock, SystemClock};
use bookmark_sync_core::tree::{
    BookmarkTree, InMemoryTree, NewNode, Result, TreeError, TreeNode, TreeSnapshot,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::debug;

/// What the file looked like when it was last loaded or saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

#[derive(Default)]
struct Cache {
    tree: Option<Arc<InMemoryTree>>,
    /// `None` when the file did not exist
    stamp: Option<Stamp>,
    batching: bool,
    /// Mutations made in the current batch are not on disk yet
    dirty: bool,
}

pub struct JsonFileTree {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    /// Also serializes load-modify-save sequences
    cache: Mutex<Cache>,
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> TreeError {
    TreeError::Io(format!("{}: {}", path.display(), e))
}

impl JsonFileTree {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clock: Arc::new(SystemClock),
            cache: Mutex::new(Cache::default()),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the permanent roots if the file does not exist yet.
    pub async fn ensure_exists(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if self.stamp().await?.is_some() {
            return Ok(());
        }
        let tree = Arc::new(self.empty());
        self.save(&tree, &mut cache).await
    }

    fn empty(&self) -> InMemoryTree {
        InMemoryTree::new().with_clock(Arc::clone(&self.clock))
    }

    async fn stamp(&self) -> Result<Option<Stamp>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(Some(Stamp {
                modified: meta.modified().map_err(|e| io_error(&self.path, e))?,
                len: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    async fn load(&self) -> Result<InMemoryTree> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist, using empty tree", self.path.display());
                return Ok(self.empty());
            }
            Err(e) => return Err(io_error(&self.path, e)),
        };
        let snapshot: TreeSnapshot =
            serde_json::from_str(&content).map_err(|e| io_error(&self.path, e))?;
        Ok(InMemoryTree::from_snapshot(snapshot)?.with_clock(Arc::clone(&self.clock)))
    }

    /// The cached tree, reloaded if the file changed behind our back.
    ///
    /// During a batch the cache is authoritative.
    async fn current(&self, cache: &mut Cache) -> Result<Arc<InMemoryTree>> {
        if let (true, Some(tree)) = (cache.batching, &cache.tree) {
            return Ok(Arc::clone(tree));
        }
        // Stat before reading, so a write in between only causes a reload
        let stamp = self.stamp().await?;
        if let Some(tree) = &cache.tree {
            if cache.stamp == stamp {
                return Ok(Arc::clone(tree));
            }
        }
        debug!("Loading {}", self.path.display());
        let tree = Arc::new(self.load().await?);
        cache.tree = Some(Arc::clone(&tree));
        cache.stamp = stamp;
        Ok(tree)
    }

    async fn save(&self, tree: &Arc<InMemoryTree>, cache: &mut Cache) -> Result<()> {
        if let Err(e) = self.write(tree).await {
            cache.tree = None;
            return Err(e);
        }
        cache.tree = Some(Arc::clone(tree));
        cache.stamp = self.stamp().await?;
        cache.dirty = false;
        Ok(())
    }

    async fn write(&self, tree: &InMemoryTree) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
        }
        let json =
            serde_json::to_string_pretty(&tree.snapshot()).map_err(|e| io_error(&self.path, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))
    }

    /// Apply `op` to the current tree and save it, or mark it dirty inside a
    /// batch.
    async fn mutate<F, Fut, V>(&self, op: F) -> Result<V>
    where
        F: FnOnce(Arc<InMemoryTree>) -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        let mut cache = self.cache.lock().await;
        let tree = self.current(&mut cache).await?;
        let value = op(Arc::clone(&tree)).await?;
        if cache.batching {
            cache.dirty = true;
        } else {
            self.save(&tree, &mut cache).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl BookmarkTree for JsonFileTree {
    async fn read_tree(&self) -> Result<Vec<TreeNode>> {
        let mut cache = self.cache.lock().await;
        self.current(&mut cache).await?.read_tree().await
    }

    async fn get(&self, id: &str) -> Result<Option<TreeNode>> {
        let mut cache = self.cache.lock().await;
        self.current(&mut cache).await?.get(id).await
    }

    async fn create(&self, node: NewNode) -> Result<TreeNode> {
        self.mutate(|tree| async move { tree.create(node).await })
            .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.mutate(|tree| async move { tree.remove(&id).await })
            .await
    }

    async fn remove_tree(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.mutate(|tree| async move { tree.remove_tree(&id).await })
            .await
    }

    async fn children(&self, id: &str) -> Result<Vec<TreeNode>> {
        let mut cache = self.cache.lock().await;
        self.current(&mut cache).await?.children(id).await
    }

    async fn search(&self, title: &str, url: Option<&str>) -> Result<Vec<TreeNode>> {
        let mut cache = self.cache.lock().await;
        self.current(&mut cache).await?.search(title, url).await
    }

    async fn move_node(&self, id: &str, parent_id: &str) -> Result<()> {
        let (id, parent_id) = (id.to_string(), parent_id.to_string());
        self.mutate(|tree| async move { tree.move_node(&id, &parent_id).await })
            .await
    }

    async fn begin_batch(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        // Start from what is on disk now
        self.current(&mut cache).await?;
        cache.batching = true;
        Ok(())
    }

    async fn commit_batch(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.batching = false;
        if !cache.dirty {
            return Ok(());
        }
        cache.dirty = false;
        match cache.tree.clone() {
            Some(tree) => {
                debug!("Saving batched changes to {}", self.path.display());
                self.save(&tree, &mut cache).await
            }
            None => Ok(()),
        }
    }
}
