//! Merge engine: the per-key decision table.
//!
//! Given both sides' item maps, the effective tombstones and this replica's
//! last completed sync, decides for every key whether to create it locally,
//! delete it locally, keep it as is, or upload it. Deletion and modification
//! are order-sensitive across replicas that sync independently, so two
//! "revive" rules let an edit that postdates a deletion win over it.
//!
//! Output is keyed by `ItemKey` in a `BTreeMap`, so the same inputs always
//! produce the same plan in the same order.

use crate::identity::ItemKey;
use crate::model::{Item, ItemMap, Tombstone, TombstoneMap};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// What to do with one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Create locally from the remote copy.
    Create,
    /// Remove locally and publish the deletion.
    Delete,
    /// Present on both sides; publish the winning record.
    Keep,
    /// Only present locally; publish it.
    Upload,
}

/// The action for a key together with the record it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub item: Item,
    pub action: Action,
}

impl Decision {
    fn new(item: Item, action: Action) -> Self {
        Self { item, action }
    }
}

/// Everything one merge produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub decisions: BTreeMap<ItemKey, Decision>,
    /// Remote deletions with no local counterpart. Nothing to do locally,
    /// but they stay in the document so lagging replicas still see them.
    pub retained: Vec<Item>,
}

impl MergePlan {
    pub fn count(&self, action: Action) -> usize {
        self.decisions
            .values()
            .filter(|d| d.action == action)
            .count()
    }

    pub fn action_for(&self, key: &ItemKey) -> Option<Action> {
        self.decisions.get(key).map(|d| d.action)
    }
}

/// Inputs for one merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    pub local: &'a ItemMap,
    pub remote: &'a ItemMap,
    pub tombstones: &'a TombstoneMap,
    /// Completion time of this replica's last cycle, 0 if never synced.
    pub my_last_sync: u64,
}

/// Decide a single key.
///
/// Returns `None` when there is nothing to do: a remote deletion of
/// something we do not have, or a local item already marked deleted that
/// the remote never saw.
pub fn decide(
    local: Option<&Item>,
    remote: Option<&Item>,
    tombstone: Option<&Tombstone>,
    my_last_sync: u64,
) -> Option<Decision> {
    match (local, remote) {
        // An explicit remote deletion is checked before "missing locally"
        (local, Some(remote)) if remote.deleted => {
            let local = local?;
            if local.date_modified > my_last_sync {
                // Edited here after we last reported: the edit wins
                Some(Decision::new(local.clone(), Action::Keep))
            } else {
                Some(Decision::new(local.clone(), Action::Delete))
            }
        }
        (None, Some(remote)) => match tombstone {
            Some(t) if remote.date_modified > t.deleted_at => {
                // Re-touched remotely after our delete: bring it back
                Some(Decision::new(remote.clone(), Action::Create))
            }
            Some(t) => {
                let mut stale = remote.clone();
                stale.title = t.title.clone();
                stale.url = t.url.clone();
                if t.parent_title.is_some() {
                    stale.parent_title = t.parent_title.clone();
                }
                Some(Decision::new(stale, Action::Delete))
            }
            None => Some(Decision::new(remote.clone(), Action::Create)),
        },
        (Some(local), Some(remote)) => {
            if local.deleted {
                return Some(Decision::new(local.clone(), Action::Delete));
            }
            // Ties favor remote
            let winner = if local.date_modified > remote.date_modified {
                local
            } else {
                remote
            };
            Some(Decision::new(winner.clone(), Action::Keep))
        }
        (Some(local), None) if !local.deleted => {
            Some(Decision::new(local.clone(), Action::Upload))
        }
        (Some(_), None) | (None, None) => None,
    }
}

/// Run the decision table over every key of both sides.
///
/// Remote keys are evaluated first, then local-only keys.
pub fn merge(input: MergeInput<'_>) -> MergePlan {
    let mut plan = MergePlan::default();

    let mut remote_keys: Vec<&ItemKey> = input.remote.keys().collect();
    remote_keys.sort();
    for key in remote_keys {
        let remote = &input.remote[key];
        let local = input.local.get(key);
        match decide(local, Some(remote), input.tombstones.get(key), input.my_last_sync) {
            Some(decision) => {
                debug!("merge {} {:?} ({})", key, decision.action, decision.item.title);
                plan.decisions.insert(key.clone(), decision);
            }
            None if remote.deleted => plan.retained.push(remote.clone()),
            None => {}
        }
    }

    let mut local_only: Vec<&ItemKey> = input
        .local
        .keys()
        .filter(|k| !input.remote.contains_key(*k))
        .collect();
    local_only.sort();
    for key in local_only {
        if let Some(decision) = decide(input.local.get(key), None, None, input.my_last_sync) {
            debug!("merge {} {:?} ({})", key, decision.action, decision.item.title);
            plan.decisions.insert(key.clone(), decision);
        }
    }

    plan
}
