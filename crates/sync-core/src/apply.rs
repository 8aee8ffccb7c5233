//! Apply engine: executes a merge plan against the local tree.
//!
//! Also owns duplicate-folder reconciliation, which runs before the local
//! snapshot is taken, and staging of the outbound item list.
//!
//! A single failed create or delete is logged and counted, never fatal. Only
//! failures to read the tree's roots or to persist tombstones abort.

use crate::merge::{Action, Decision, MergePlan};
use crate::model::Item;
use crate::snapshot::{attributed_title, item_for_node};
use crate::store::{StateStore, StoreError};
use crate::tombstones::{TombstoneStore, TOMBSTONE_TTL};
use crate::tree::{BookmarkTree, NewNode, RootRole, TreeError, TreeNode};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("State error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ApplyError>;

/// What applying a plan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Items for the outbound document, in key order.
    pub outbound: Vec<Item>,
}

// ============================================================================
// Duplicate folders
// ============================================================================

struct ContainerRef {
    id: String,
    item: Item,
}

fn collect_containers(node: &TreeNode, parent_title: Option<&str>, out: &mut Vec<ContainerRef>) {
    if !node.is_container() {
        return;
    }
    if !node.is_permanent() {
        out.push(ContainerRef {
            id: node.id.clone(),
            item: item_for_node(node, parent_title),
        });
    }
    for child in &node.children {
        collect_containers(child, Some(attributed_title(node)), out);
    }
}

/// Fold every folder that shares its title with an earlier folder (in
/// depth-first order) into that first one, then delete it.
///
/// A removed duplicate whose key differs from the survivor's is tombstoned,
/// so its remote entry is deleted rather than recreated. Returns how many
/// folders were removed.
pub async fn reconcile_duplicate_containers<T, S>(
    tree: &T,
    tombstones: &mut TombstoneStore<'_, S>,
    now: u64,
) -> Result<usize>
where
    T: BookmarkTree + ?Sized,
    S: StateStore + ?Sized,
{
    let mut containers = Vec::new();
    for root in tree.read_tree().await? {
        collect_containers(&root, None, &mut containers);
    }

    let mut survivors: HashMap<String, ContainerRef> = HashMap::new();
    let mut removed = 0;
    for duplicate in containers {
        let Some(survivor) = survivors.get(&duplicate.item.title) else {
            survivors.insert(duplicate.item.title.clone(), duplicate);
            continue;
        };

        let children = match tree.children(&duplicate.id).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Skipping duplicate folder '{}': {}", duplicate.item.title, e);
                continue;
            }
        };
        let mut stranded = false;
        for child in children {
            if let Err(e) = tree.move_node(&child.id, &survivor.id).await {
                warn!("Failed to move '{}' out of duplicate folder: {}", child.title, e);
                stranded = true;
            }
        }
        if stranded {
            // Keep the folder rather than drop what could not be moved
            continue;
        }
        if let Err(e) = tree.remove_tree(&duplicate.id).await {
            warn!("Failed to remove duplicate folder '{}': {}", duplicate.item.title, e);
            continue;
        }

        removed += 1;
        info!(
            "Merged duplicate folder '{}' ({}) into {}",
            duplicate.item.title, duplicate.id, survivor.id
        );
        if duplicate.item.key != survivor.item.key {
            tombstones.record(&duplicate.item, now).await?;
        }
    }
    Ok(removed)
}

// ============================================================================
// Folder resolution
// ============================================================================

/// Maps parent titles to live folder ids for the duration of one apply.
struct FolderResolver<'t, T: BookmarkTree + ?Sized> {
    tree: &'t T,
    toolbar: String,
    other: String,
    cache: HashMap<String, String>,
}

impl<'t, T: BookmarkTree + ?Sized> FolderResolver<'t, T> {
    async fn new(tree: &'t T) -> Result<Self> {
        let roots = tree.read_tree().await?;
        let root_id = |role: RootRole| {
            roots
                .iter()
                .find(|r| r.role == Some(role))
                .map(|r| r.id.clone())
                .ok_or_else(|| TreeError::NotFound(format!("permanent root {:?}", role)))
        };
        Ok(Self {
            tree,
            toolbar: root_id(RootRole::Toolbar)?,
            other: root_id(RootRole::Other)?,
            cache: HashMap::new(),
        })
    }

    fn root(&self, role: RootRole) -> String {
        match role {
            RootRole::Toolbar => self.toolbar.clone(),
            RootRole::Other => self.other.clone(),
        }
    }

    async fn is_live_container(&self, id: &str) -> bool {
        matches!(self.tree.get(id).await, Ok(Some(node)) if node.is_container())
    }

    /// Folder id for a parent title. Unknown titles land in Other Bookmarks.
    async fn resolve(&mut self, parent_title: Option<&str>) -> String {
        let Some(title) = parent_title else {
            return self.other.clone();
        };
        if let Some(role) = RootRole::from_canonical_title(title) {
            return self.root(role);
        }

        if let Some(id) = self.cache.get(title).cloned() {
            if self.is_live_container(&id).await {
                return id;
            }
            debug!("Folder '{}' vanished mid-cycle, resolving again", title);
            self.cache.remove(title);
        }

        match self.tree.search(title, None).await {
            Ok(found) => {
                if let Some(node) = found.into_iter().next() {
                    self.cache.insert(title.to_string(), node.id.clone());
                    return node.id;
                }
            }
            Err(e) => warn!("Folder lookup for '{}' failed: {}", title, e),
        }
        debug!("No folder titled '{}', using Other Bookmarks", title);
        self.other.clone()
    }

    /// Record a folder created during this apply, unless one is known already.
    fn remember(&mut self, title: &str, id: &str) {
        self.cache
            .entry(title.to_string())
            .or_insert_with(|| id.to_string());
    }
}

// ============================================================================
// Apply
// ============================================================================

/// Live node an item refers to.
///
/// Matches on exact title and url; among several matches, prefers the one
/// whose parent is attributed the item's parent title.
async fn find_live<T: BookmarkTree + ?Sized>(
    tree: &T,
    item: &Item,
) -> crate::tree::Result<Option<TreeNode>> {
    let candidates = tree.search(&item.title, item.url.as_deref()).await?;
    if candidates.len() > 1 {
        let expected = item
            .parent_title
            .as_deref()
            .unwrap_or(RootRole::Other.canonical_title());
        for candidate in &candidates {
            let Some(parent_id) = candidate.parent_id.as_deref() else {
                continue;
            };
            if let Some(parent) = tree.get(parent_id).await? {
                if attributed_title(&parent) == expected {
                    return Ok(Some(candidate.clone()));
                }
            }
        }
    }
    Ok(candidates.into_iter().next())
}

/// Creates in dependency order: folders first, a folder after any folder
/// it is nested in, then leaves.
fn creation_order(plan: &MergePlan) -> Vec<&Decision> {
    let (mut pending, leaves): (Vec<&Decision>, Vec<&Decision>) = plan
        .decisions
        .values()
        .filter(|d| d.action == Action::Create)
        .partition(|d| d.item.is_container());

    let mut ordered = Vec::with_capacity(pending.len() + leaves.len());
    while !pending.is_empty() {
        let (ready, blocked): (Vec<&Decision>, Vec<&Decision>) =
            pending.iter().copied().partition(|d| match d.item.parent_title.as_deref() {
                Some(parent) => !pending
                    .iter()
                    .any(|p| p.item.key != d.item.key && p.item.title == parent),
                None => true,
            });
        if ready.is_empty() {
            // Titles that name each other as parents
            ordered.extend(blocked);
            break;
        }
        ordered.extend(ready);
        pending = blocked;
    }
    ordered.extend(leaves);
    ordered
}

fn stage(decision: &Decision, now: u64) -> Item {
    let mut item = decision.item.clone();
    if decision.action == Action::Delete {
        item.deleted = true;
        item.date_modified = now;
    } else {
        item.deleted = false;
    }
    item
}

/// Execute `plan` against `tree` and stage the outbound item list.
///
/// Deletes run first, then creates. A successful create clears any
/// tombstone for its key.
pub async fn apply<T, S>(
    plan: &MergePlan,
    tree: &T,
    tombstones: &mut TombstoneStore<'_, S>,
    now: u64,
) -> Result<ApplyOutcome>
where
    T: BookmarkTree + ?Sized,
    S: StateStore + ?Sized,
{
    let mut outcome = ApplyOutcome::default();

    for (key, decision) in &plan.decisions {
        if decision.action != Action::Delete {
            continue;
        }
        let item = &decision.item;
        match find_live(tree, item).await {
            Ok(Some(node)) => {
                let removed = if node.is_container() {
                    tree.remove_tree(&node.id).await
                } else {
                    tree.remove(&node.id).await
                };
                match removed {
                    Ok(()) => {
                        outcome.deleted += 1;
                        debug!("Deleted {} '{}'", key, item.title);
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        warn!("Failed to delete '{}': {}", item.title, e);
                    }
                }
            }
            Ok(None) => debug!("Nothing to delete for {} '{}'", key, item.title),
            Err(e) => {
                outcome.failed += 1;
                warn!("Failed to look up '{}': {}", item.title, e);
            }
        }
    }

    let mut resolver = FolderResolver::new(tree).await?;
    for decision in creation_order(plan) {
        let item = &decision.item;
        let parent_id = resolver.resolve(item.parent_title.as_deref()).await;
        let node = NewNode {
            parent_id,
            title: item.title.clone(),
            url: item.url.clone(),
        };
        match tree.create(node).await {
            Ok(created) => {
                outcome.created += 1;
                debug!("Created {} '{}'", item.key, item.title);
                if created.is_container() {
                    resolver.remember(&item.title, &created.id);
                }
                tombstones.clear(&item.key, now).await?;
            }
            Err(e) => {
                outcome.failed += 1;
                warn!("Failed to create '{}': {}", item.title, e);
            }
        }
    }

    outcome.outbound = plan.decisions.values().map(|d| stage(d, now)).collect();
    let ttl = TOMBSTONE_TTL.as_millis() as u64;
    outcome.outbound.extend(
        plan.retained
            .iter()
            .filter(|item| now.saturating_sub(item.date_modified) < ttl)
            .cloned(),
    );
    outcome.outbound.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(outcome)
}
