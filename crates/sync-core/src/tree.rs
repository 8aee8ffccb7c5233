//! BookmarkTree trait abstraction for the local bookmark store.
//!
//! Implementations:
//! - `InMemoryTree` - For testing, and as the working copy of file-backed trees
//! - `JsonFileTree` (in sync-daemon) - A JSON bookmarks file on disk
//!
//! Every tree has exactly two permanent roots, identified by `RootRole`.
//! Their display titles are whatever the host uses (and may be localized);
//! nothing in the engine compares against them.

use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Permanent node cannot be modified: {0}")]
    PermanentNode(String),

    #[error("Not a folder: {0}")]
    NotContainer(String),

    #[error("Folder is not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid parent {parent} for node {id}")]
    InvalidParent { id: String, parent: String },

    #[error("Create rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// Structural role of a permanent root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootRole {
    /// The bookmarks toolbar.
    Toolbar,
    /// Everything not on the toolbar.
    Other,
}

impl RootRole {
    pub const ALL: [RootRole; 2] = [RootRole::Toolbar, RootRole::Other];

    /// Locale-independent title that children of this root are attributed to.
    pub fn canonical_title(&self) -> &'static str {
        match self {
            RootRole::Toolbar => "Bookmarks Bar",
            RootRole::Other => "Other Bookmarks",
        }
    }

    /// The root a canonical title refers to, if any.
    pub fn from_canonical_title(title: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.canonical_title() == title)
    }
}

/// A node of the local tree, with its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    /// Not stored on disk; rebuilt from nesting on load.
    #[serde(skip)]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub date_added: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RootRole>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn is_container(&self) -> bool {
        self.url.is_none()
    }

    pub fn is_permanent(&self) -> bool {
        self.role.is_some()
    }
}

/// Parameters for creating a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub parent_id: String,
    pub title: String,
    /// `None` creates a folder.
    pub url: Option<String>,
}

/// Serialized form of a whole tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub next_id: u64,
    pub roots: Vec<TreeNode>,
}

/// Local bookmark store consumed by the sync engine.
#[async_trait]
pub trait BookmarkTree: Send + Sync {
    /// The permanent roots with all descendants.
    async fn read_tree(&self) -> Result<Vec<TreeNode>>;

    /// A single node (with descendants), or `None` if it no longer exists.
    async fn get(&self, id: &str) -> Result<Option<TreeNode>>;

    /// Create a bookmark or folder under `parent_id`.
    async fn create(&self, node: NewNode) -> Result<TreeNode>;

    /// Remove a bookmark or an empty folder.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Remove a folder and everything below it.
    async fn remove_tree(&self, id: &str) -> Result<()>;

    /// Direct children of a folder.
    async fn children(&self, id: &str) -> Result<Vec<TreeNode>>;

    /// Non-permanent nodes with exactly this title and url (`None` matches folders).
    async fn search(&self, title: &str, url: Option<&str>) -> Result<Vec<TreeNode>>;

    /// Reparent a node.
    async fn move_node(&self, id: &str, parent_id: &str) -> Result<()>;

    /// Hold back persisting mutations until `commit_batch`. A cycle wraps its
    /// local changes in one batch.
    async fn begin_batch(&self) -> Result<()> {
        Ok(())
    }

    /// Persist held-back mutations and stop batching. No-op outside a batch.
    async fn commit_batch(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Record {
    parent_id: Option<String>,
    title: String,
    url: Option<String>,
    date_added: u64,
    date_modified: Option<u64>,
    role: Option<RootRole>,
    children: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<String, Record>,
    roots: Vec<String>,
    next_id: u64,
}

impl State {
    fn node(&self, id: &str) -> Option<TreeNode> {
        let record = self.nodes.get(id)?;
        Some(TreeNode {
            id: id.to_string(),
            parent_id: record.parent_id.clone(),
            title: record.title.clone(),
            url: record.url.clone(),
            date_added: record.date_added,
            date_modified: record.date_modified,
            role: record.role,
            children: record
                .children
                .iter()
                .filter_map(|child| self.node(child))
                .collect(),
        })
    }

    fn record(&self, id: &str) -> Result<&Record> {
        self.nodes
            .get(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))
    }

    fn touch(&mut self, id: &str, now: u64) {
        if let Some(record) = self.nodes.get_mut(id) {
            record.date_modified = Some(now);
        }
    }

    fn detach(&mut self, id: &str) {
        let parent = self.nodes.get(id).and_then(|r| r.parent_id.clone());
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| c != id);
        }
    }

    fn drop_subtree(&mut self, id: &str) {
        if let Some(record) = self.nodes.remove(id) {
            for child in record.children {
                self.drop_subtree(&child);
            }
        }
    }

    fn is_descendant(&self, candidate: &str, ancestor: &str) -> bool {
        let mut current = Some(candidate.to_string());
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|r| r.parent_id.clone());
        }
        false
    }

    fn insert_snapshot_node(&mut self, node: &TreeNode, parent_id: Option<&str>) {
        let record = Record {
            parent_id: parent_id.map(str::to_string),
            title: node.title.clone(),
            url: node.url.clone(),
            date_added: node.date_added,
            date_modified: node.date_modified,
            role: node.role,
            children: node.children.iter().map(|c| c.id.clone()).collect(),
        };
        self.nodes.insert(node.id.clone(), record);
        for child in &node.children {
            self.insert_snapshot_node(child, Some(&node.id));
        }
    }
}

/// In-memory bookmark tree.
pub struct InMemoryTree {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    /// Titles whose creation is refused, to exercise apply failures
    rejected_titles: RwLock<HashSet<String>>,
}

impl InMemoryTree {
    /// A tree with the two permanent roots, titled as in an English browser.
    pub fn new() -> Self {
        Self::with_root_titles("Bookmarks Bar", "Other Bookmarks")
    }

    /// A tree whose permanent roots carry the given display titles.
    pub fn with_root_titles(toolbar: &str, other: &str) -> Self {
        let mut state = State {
            next_id: 3,
            ..State::default()
        };
        for (id, title, role) in [("1", toolbar, RootRole::Toolbar), ("2", other, RootRole::Other)] {
            state.nodes.insert(
                id.to_string(),
                Record {
                    parent_id: None,
                    title: title.to_string(),
                    url: None,
                    date_added: 0,
                    date_modified: None,
                    role: Some(role),
                    children: Vec::new(),
                },
            );
            state.roots.push(id.to_string());
        }
        Self {
            state: RwLock::new(state),
            clock: Arc::new(SystemClock),
            rejected_titles: RwLock::new(HashSet::new()),
        }
    }

    /// Rebuild a tree from its serialized form.
    ///
    /// Both permanent roles must be present among the top-level nodes.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Result<Self> {
        let mut state = State {
            next_id: snapshot.next_id,
            ..State::default()
        };
        for role in RootRole::ALL {
            if !snapshot.roots.iter().any(|r| r.role == Some(role)) {
                return Err(TreeError::NotFound(format!("permanent root {:?}", role)));
            }
        }
        for root in &snapshot.roots {
            state.insert_snapshot_node(root, None);
            state.roots.push(root.id.clone());
        }
        // Never hand out an id that is already taken
        let max_id = state
            .nodes
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        state.next_id = state.next_id.max(max_id + 1);

        Ok(Self {
            state: RwLock::new(state),
            clock: Arc::new(SystemClock),
            rejected_titles: RwLock::new(HashSet::new()),
        })
    }

    /// Use a different clock for creation and modification timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        TreeSnapshot {
            next_id: state.next_id,
            roots: state.roots.iter().filter_map(|id| state.node(id)).collect(),
        }
    }

    /// Id of a permanent root.
    pub fn root_id(&self, role: RootRole) -> String {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .roots
            .iter()
            .find(|id| state.nodes.get(*id).and_then(|r| r.role) == Some(role))
            .cloned()
            .unwrap_or_default()
    }

    /// Set a specific modification time for testing "latest wins" scenarios
    pub fn set_date_modified(&self, id: &str, date_modified: u64) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.touch(id, date_modified);
    }

    /// Make every future `create` with this title fail.
    pub fn reject_creates_titled(&self, title: &str) {
        self.rejected_titles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(title.to_string());
    }

    /// Number of non-permanent nodes.
    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.nodes.len() - state.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BookmarkTree for InMemoryTree {
    async fn read_tree(&self) -> Result<Vec<TreeNode>> {
        Ok(self.snapshot().roots)
    }

    async fn get(&self, id: &str) -> Result<Option<TreeNode>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.node(id))
    }

    async fn create(&self, node: NewNode) -> Result<TreeNode> {
        if self
            .rejected_titles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&node.title)
        {
            return Err(TreeError::Rejected(node.title));
        }

        let now = self.clock.now_ms();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.record(&node.parent_id)?.url.is_some() {
            return Err(TreeError::NotContainer(node.parent_id));
        }

        let id = state.next_id.to_string();
        state.next_id += 1;
        state.nodes.insert(
            id.clone(),
            Record {
                parent_id: Some(node.parent_id.clone()),
                title: node.title,
                url: node.url,
                date_added: now,
                date_modified: None,
                role: None,
                children: Vec::new(),
            },
        );
        if let Some(parent) = state.nodes.get_mut(&node.parent_id) {
            parent.children.push(id.clone());
        }
        state.touch(&node.parent_id, now);

        state.node(&id).ok_or(TreeError::NotFound(id))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let record = state.record(id)?;
        if record.role.is_some() {
            return Err(TreeError::PermanentNode(id.to_string()));
        }
        if !record.children.is_empty() {
            return Err(TreeError::NotEmpty(id.to_string()));
        }
        let parent = record.parent_id.clone();

        state.detach(id);
        state.nodes.remove(id);
        if let Some(parent) = parent {
            state.touch(&parent, now);
        }
        Ok(())
    }

    async fn remove_tree(&self, id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let record = state.record(id)?;
        if record.role.is_some() {
            return Err(TreeError::PermanentNode(id.to_string()));
        }
        let parent = record.parent_id.clone();

        state.detach(id);
        state.drop_subtree(id);
        if let Some(parent) = parent {
            state.touch(&parent, now);
        }
        Ok(())
    }

    async fn children(&self, id: &str) -> Result<Vec<TreeNode>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let record = state.record(id)?;
        Ok(record
            .children
            .iter()
            .filter_map(|child| state.node(child))
            .collect())
    }

    async fn search(&self, title: &str, url: Option<&str>) -> Result<Vec<TreeNode>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<&String> = state
            .nodes
            .iter()
            .filter(|(_, r)| r.role.is_none() && r.title == title && r.url.as_deref() == url)
            .map(|(id, _)| id)
            .collect();
        // Creation order, so "first" is stable
        ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), (*id).clone()));
        Ok(ids.into_iter().filter_map(|id| state.node(id)).collect())
    }

    async fn move_node(&self, id: &str, parent_id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.record(id)?.role.is_some() {
            return Err(TreeError::PermanentNode(id.to_string()));
        }
        let invalid = || TreeError::InvalidParent {
            id: id.to_string(),
            parent: parent_id.to_string(),
        };
        if state.record(parent_id)?.url.is_some() || state.is_descendant(parent_id, id) {
            return Err(invalid());
        }
        let old_parent = state.record(id)?.parent_id.clone();

        state.detach(id);
        if let Some(parent) = state.nodes.get_mut(parent_id) {
            parent.children.push(id.to_string());
        }
        if let Some(record) = state.nodes.get_mut(id) {
            record.parent_id = Some(parent_id.to_string());
            record.date_modified = Some(now);
        }
        state.touch(parent_id, now);
        if let Some(old_parent) = old_parent {
            state.touch(&old_parent, now);
        }
        Ok(())
    }
}

// Lets a tree be shared between an orchestrator and the test driving it
#[async_trait]
impl<T: BookmarkTree> BookmarkTree for Arc<T> {
    async fn read_tree(&self) -> Result<Vec<TreeNode>> {
        (**self).read_tree().await
    }

    async fn get(&self, id: &str) -> Result<Option<TreeNode>> {
        (**self).get(id).await
    }

    async fn create(&self, node: NewNode) -> Result<TreeNode> {
        (**self).create(node).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        (**self).remove(id).await
    }

    async fn remove_tree(&self, id: &str) -> Result<()> {
        (**self).remove_tree(id).await
    }

    async fn children(&self, id: &str) -> Result<Vec<TreeNode>> {
        (**self).children(id).await
    }

    async fn search(&self, title: &str, url: Option<&str>) -> Result<Vec<TreeNode>> {
        (**self).search(title, url).await
    }

    async fn move_node(&self, id: &str, parent_id: &str) -> Result<()> {
        (**self).move_node(id, parent_id).await
    }

    async fn begin_batch(&self) -> Result<()> {
        (**self).begin_batch().await
    }

    async fn commit_batch(&self) -> Result<()> {
        (**self).commit_batch().await
    }
}
