// ── Stores ──
//
// Caches, persisted snapshots, and the reactive entity store. Only the
// central's apply path mutates these; everyone else reads.

pub(crate) mod collection;
pub mod description_cache;
pub mod persist;
pub mod value_cache;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use crate::model::{Entity, EntityId};
use crate::stream::{EntityStream, EntitySubscription};
use collection::EntityCollection;

pub use description_cache::{DescriptionCache, DescriptionSnapshot};
pub use persist::{InterfaceSnapshot, LoadOutcome, PersistentStore};
pub use value_cache::{ApplyOutcome, CacheLookup, PersistedValue, ValueCache, ValueKey};

// ── EntityStore ──────────────────────────────────────────────────────

/// All materialized entities of a central, indexed by device and by
/// backing parameter.
pub struct EntityStore {
    entities: EntityCollection<Entity>,
    /// `(interface_id, device_address)` -> entity ids.
    by_device: DashMap<(String, String), BTreeSet<EntityId>>,
    /// `(interface_id, ValueKey)` -> entity ids backed by that parameter.
    by_backing: DashMap<(String, ValueKey), BTreeSet<EntityId>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            entities: EntityCollection::new(),
            by_device: DashMap::new(),
            by_backing: DashMap::new(),
        }
    }

    /// Insert or replace an entity. Returns `true` if it is new.
    pub(crate) fn upsert(&self, entity: Entity) -> bool {
        let id = entity.id.clone();
        if let Some(old) = self.entities.get(&id) {
            self.unindex(&old);
        }
        self.index(&entity);
        self.entities.upsert(id, entity)
    }

    /// Replace an entity's state without touching the indexes.
    ///
    /// Only for updates that keep the backing parameter set.
    pub(crate) fn update(&self, entity: Entity) {
        let id = entity.id.clone();
        self.entities.upsert(id, entity);
    }

    pub(crate) fn remove(&self, id: &EntityId) -> Option<Arc<Entity>> {
        let removed = self.entities.remove(id)?;
        self.unindex(&removed);
        Some(removed)
    }

    /// Remove every entity of one device. Returns the removed ids.
    pub(crate) fn remove_device(&self, interface_id: &str, device_address: &str) -> Vec<EntityId> {
        let ids = self.ids_for_device(interface_id, device_address);
        for id in &ids {
            self.remove(id);
        }
        ids
    }

    pub fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.entities.get(id)
    }

    pub fn ids_for_device(&self, interface_id: &str, device_address: &str) -> Vec<EntityId> {
        self.by_device
            .get(&(interface_id.to_owned(), device_address.to_owned()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn for_device(&self, interface_id: &str, device_address: &str) -> Vec<Arc<Entity>> {
        self.ids_for_device(interface_id, device_address)
            .iter()
            .filter_map(|id| self.entities.get(id))
            .collect()
    }

    /// Entities reading or writing `key` on `interface_id`.
    pub fn backed_by(&self, interface_id: &str, key: &ValueKey) -> Vec<EntityId> {
        self.by_backing
            .get(&(interface_id.to_owned(), key.clone()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entities of one interface, ordered by id.
    pub fn for_interface(&self, interface_id: &str) -> Vec<Arc<Entity>> {
        self.entities
            .snapshot()
            .iter()
            .filter(|e| e.interface_id == interface_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Entity>>> {
        self.entities.snapshot()
    }

    pub fn stream(&self) -> EntityStream<Entity> {
        EntityStream::new(self.entities.subscribe())
    }

    pub fn subscribe(&self, id: &EntityId) -> Option<EntitySubscription<Entity>> {
        self.entities.watch(id).map(EntitySubscription::new)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.entities.clear();
        self.by_device.clear();
        self.by_backing.clear();
    }

    // ── Index maintenance ────────────────────────────────────────────

    fn index(&self, entity: &Entity) {
        self.by_device
            .entry((entity.interface_id.clone(), entity.device_address.clone()))
            .or_default()
            .insert(entity.id.clone());
        for (channel, parameter) in entity.backing() {
            self.by_backing
                .entry((entity.interface_id.clone(), ValueKey::new(channel, parameter)))
                .or_default()
                .insert(entity.id.clone());
        }
    }

    fn unindex(&self, entity: &Entity) {
        let device_key = (entity.interface_id.clone(), entity.device_address.clone());
        self.by_device.remove_if_mut(&device_key, |_, ids| {
            ids.remove(&entity.id);
            ids.is_empty()
        });

        let keys: HashSet<ValueKey> = entity
            .backing()
            .map(|(channel, parameter)| ValueKey::new(channel, parameter))
            .collect();
        for key in keys {
            self.by_backing
                .remove_if_mut(&(entity.interface_id.clone(), key), |_, ids| {
                    ids.remove(&entity.id);
                    ids.is_empty()
                });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{EntityField, EntityKind, FieldRole};

    fn generic(channel: &str, parameter: &str) -> Entity {
        Entity {
            id: EntityId::generic(channel, parameter),
            interface_id: "rf".into(),
            device_address: crate::model::address::device_address(channel).to_owned(),
            device_type: "HmIP-PS".into(),
            kind: EntityKind::Generic,
            fields: vec![EntityField {
                name: parameter.to_ascii_lowercase(),
                role: FieldRole::Primary,
                channel_address: channel.into(),
                parameter: parameter.into(),
                value: None,
            }],
            last_updated: None,
            uncertain: true,
        }
    }

    #[test]
    fn indexes_follow_upsert_and_remove() {
        let store = EntityStore::new();
        store.upsert(generic("ABC123:3", "STATE"));
        store.upsert(generic("ABC123:0", "RSSI_DEVICE"));

        assert_eq!(store.ids_for_device("rf", "ABC123").len(), 2);
        let key = ValueKey::new("ABC123:3", "STATE");
        assert_eq!(store.backed_by("rf", &key), vec![EntityId::from("ABC123:3/STATE")]);

        store.remove(&EntityId::from("ABC123:3/STATE"));
        assert!(store.backed_by("rf", &key).is_empty());
        assert_eq!(store.ids_for_device("rf", "ABC123").len(), 1);
    }

    #[test]
    fn remove_device_is_scoped_to_interface() {
        let store = EntityStore::new();
        store.upsert(generic("ABC123:3", "STATE"));
        let mut other = generic("ABC123:3", "LEVEL");
        other.interface_id = "wired".into();
        store.upsert(other);

        let removed = store.remove_device("rf", "ABC123");
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.for_interface("wired").len(), 1);
    }
}
