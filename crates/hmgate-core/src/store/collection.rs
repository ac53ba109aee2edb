// ── Generic reactive entity collection ──
//
// Concurrent storage with O(1) lookups and push-based change
// notification via `watch` channels, both for the whole collection and
// for single ids.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::model::EntityId;

/// A reactive collection keyed by [`EntityId`].
///
/// Every mutation bumps a version counter and rebuilds the id-ordered
/// snapshot that collection subscribers receive. Per-id watchers are
/// created on demand and see `None` once their id is removed.
pub(crate) struct EntityCollection<T: Send + Sync + 'static> {
    by_id: DashMap<EntityId, Arc<T>>,

    /// Per-id subscribers. Dropped with the entry on removal.
    watchers: DashMap<EntityId, watch::Sender<Option<Arc<T>>>>,

    version: watch::Sender<u64>,

    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> EntityCollection<T> {
    pub(crate) fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_id: DashMap::new(),
            watchers: DashMap::new(),
            version,
            snapshot,
        }
    }

    /// Insert or replace an entity. Returns `true` if the id was new.
    pub(crate) fn upsert(&self, id: EntityId, entity: T) -> bool {
        let entity = Arc::new(entity);
        let is_new = self.by_id.insert(id.clone(), Arc::clone(&entity)).is_none();

        if let Some(watcher) = self.watchers.get(&id) {
            watcher.send_replace(Some(entity));
        }

        self.rebuild_snapshot();
        self.bump_version();

        is_new
    }

    /// Remove an entity. Returns it if it existed.
    pub(crate) fn remove(&self, id: &EntityId) -> Option<Arc<T>> {
        let removed = self.by_id.remove(id).map(|(_, v)| v);
        if removed.is_some() {
            if let Some((_, watcher)) = self.watchers.remove(id) {
                watcher.send_replace(None);
            }
            self.rebuild_snapshot();
            self.bump_version();
        }
        removed
    }

    pub(crate) fn get(&self, id: &EntityId) -> Option<Arc<T>> {
        self.by_id.get(id).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn contains(&self, id: &EntityId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Get the current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes via a `watch::Receiver`.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    /// Subscribe to one id. `None` if the id is unknown.
    pub(crate) fn watch(&self, id: &EntityId) -> Option<watch::Receiver<Option<Arc<T>>>> {
        let current = self.get(id)?;
        let watcher = self
            .watchers
            .entry(id.clone())
            .or_insert_with(|| watch::channel(Some(current)).0);
        Some(watcher.subscribe())
    }

    /// Remove all entities. Per-id subscribers see the removal.
    pub(crate) fn clear(&self) {
        self.by_id.clear();
        for entry in self.watchers.iter() {
            entry.value().send_replace(None);
        }
        self.watchers.clear();
        self.rebuild_snapshot();
        self.bump_version();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub(crate) fn version(&self) -> u64 {
        *self.version.borrow()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn rebuild_snapshot(&self) {
        let mut entries: Vec<(EntityId, Arc<T>)> = self
            .by_id
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let values = entries.into_iter().map(|(_, v)| v).collect();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}
