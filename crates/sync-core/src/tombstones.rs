//! Tombstone store: local deletion records with a fixed expiry.
//!
//! Every mutation prunes expired entries and is written through to the
//! `StateStore` right away, so bookkeeping done before a failed cycle stands.

use crate::identity::ItemKey;
use crate::model::{Item, Tombstone, TombstoneMap};
use crate::store::{Result, StateStore};
use std::time::Duration;
use tracing::debug;

/// How long a deletion is remembered.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn is_live(tombstone: &Tombstone, now: u64) -> bool {
    now.saturating_sub(tombstone.deleted_at) < TOMBSTONE_TTL.as_millis() as u64
}

/// Drop expired entries. Returns how many were removed.
pub fn prune(tombstones: &mut TombstoneMap, now: u64) -> usize {
    let before = tombstones.len();
    tombstones.retain(|_, t| is_live(t, now));
    before - tombstones.len()
}

pub struct TombstoneStore<'a, S: StateStore + ?Sized> {
    store: &'a S,
    entries: TombstoneMap,
}

impl<'a, S: StateStore + ?Sized> TombstoneStore<'a, S> {
    /// Load and prune. Persists again only if something expired.
    pub async fn load(store: &'a S, now: u64) -> Result<Self> {
        let mut entries = store.load_tombstones().await?;
        let expired = prune(&mut entries, now);
        if expired > 0 {
            debug!("Pruned {} expired tombstone(s)", expired);
            store.save_tombstones(&entries).await?;
        }
        Ok(Self { store, entries })
    }

    pub fn get(&self, key: &ItemKey) -> Option<&Tombstone> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &TombstoneMap {
        &self.entries
    }

    /// Remember that `item` was deleted locally at `now`.
    pub async fn record(&mut self, item: &Item, now: u64) -> Result<()> {
        prune(&mut self.entries, now);
        self.entries
            .insert(item.key.clone(), Tombstone::for_item(item, now));
        self.store.save_tombstones(&self.entries).await
    }

    /// Forget a deletion because the key exists again. Returns whether an
    /// entry was removed.
    pub async fn clear(&mut self, key: &ItemKey, now: u64) -> Result<bool> {
        let expired = prune(&mut self.entries, now);
        let removed = self.entries.remove(key).is_some();
        if removed || expired > 0 {
            self.store.save_tombstones(&self.entries).await?;
        }
        Ok(removed)
    }

    /// Remote-declared tombstones overlaid with local ones (local wins),
    /// without expired entries.
    pub fn effective_view(&self, remote: &TombstoneMap, now: u64) -> TombstoneMap {
        let mut view: TombstoneMap = remote
            .iter()
            .filter(|(_, t)| is_live(t, now))
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        for (key, tombstone) in &self.entries {
            view.insert(key.clone(), tombstone.clone());
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    const HOUR: u64 = 60 * 60 * 1000;

    fn item(url: &str) -> Item {
        Item::new("T", Some(url.to_string()), None, 1, 1)
    }

    #[tokio::test]
    async fn test_record_persists_immediately() {
        let store = MemoryStateStore::new();
        let mut tombstones = TombstoneStore::load(&store, 1000).await.unwrap();
        let x = item("http://x.test");

        tombstones.record(&x, 1000).await.unwrap();

        let saved = store.tombstones();
        assert_eq!(saved[&x.key].deleted_at, 1000);
        assert_eq!(saved[&x.key].url.as_deref(), Some("http://x.test"));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStateStore::new();
        let mut tombstones = TombstoneStore::load(&store, 0).await.unwrap();
        let x = item("http://x.test");
        tombstones.record(&x, 10).await.unwrap();

        assert!(tombstones.clear(&x.key, 20).await.unwrap());
        assert!(!tombstones.clear(&x.key, 20).await.unwrap());
        assert!(store.tombstones().is_empty());
    }

    #[tokio::test]
    async fn test_expired_tombstone_absent_on_next_read() {
        let store = MemoryStateStore::new();
        let x = item("http://x.test");
        {
            let mut tombstones = TombstoneStore::load(&store, 0).await.unwrap();
            tombstones.record(&x, 5 * HOUR).await.unwrap();
        }

        let fresh = TombstoneStore::load(&store, 28 * HOUR).await.unwrap();
        assert!(fresh.get(&x.key).is_some());

        let expired = TombstoneStore::load(&store, 29 * HOUR + 1).await.unwrap();
        assert!(expired.get(&x.key).is_none());
        // Pruning is persisted too
        assert!(store.tombstones().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_prunes_others() {
        let store = MemoryStateStore::new();
        let mut tombstones = TombstoneStore::load(&store, 0).await.unwrap();
        let old = item("http://old.test");
        let new = item("http://new.test");

        tombstones.record(&old, 0).await.unwrap();
        tombstones.record(&new, 25 * HOUR).await.unwrap();

        assert!(tombstones.get(&old.key).is_none());
        assert_eq!(store.tombstones().len(), 1);
    }

    #[tokio::test]
    async fn test_effective_view_local_wins() {
        let store = MemoryStateStore::new();
        let mut tombstones = TombstoneStore::load(&store, 0).await.unwrap();
        let shared = item("http://shared.test");
        let remote_only = item("http://remote.test");
        let stale = item("http://stale.test");
        tombstones.record(&shared, 300).await.unwrap();

        let mut remote = TombstoneMap::new();
        remote.insert(shared.key.clone(), Tombstone::for_item(&shared, 100));
        remote.insert(remote_only.key.clone(), Tombstone::for_item(&remote_only, 200));
        remote.insert(stale.key.clone(), Tombstone::for_item(&stale, 0));

        let view = tombstones.effective_view(&remote, 24 * HOUR + 50);
        assert_eq!(view[&shared.key].deleted_at, 300);
        assert_eq!(view[&remote_only.key].deleted_at, 200);
        assert!(!view.contains_key(&stale.key));
    }
}
