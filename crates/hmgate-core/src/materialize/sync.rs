// ── Applying materialized entities ──
//
// Upsert-then-prune per device: identity-preserving updates are left
// alone, vanished entities are removed, new ones inserted.

use std::collections::HashSet;

use crate::model::{Entity, EntityId};
use crate::store::{EntityStore, ValueCache};

use super::fill_state;

/// What one device sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<EntityId>,
    pub removed: Vec<EntityId>,
    /// Same identity, new state.
    pub updated: Vec<EntityId>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Replace one device's entities with `entities`.
pub(crate) fn sync_device(
    store: &EntityStore,
    interface_id: &str,
    device_address: &str,
    entities: Vec<Entity>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let incoming: HashSet<EntityId> = entities.iter().map(|e| e.id.clone()).collect();

    for entity in entities {
        match store.get(&entity.id) {
            Some(existing) if existing.same_identity(&entity) => {
                if *existing != entity {
                    report.updated.push(entity.id.clone());
                    store.update(entity);
                }
            }
            Some(_) => {
                // Backing parameters changed: re-index under the same id.
                report.removed.push(entity.id.clone());
                report.added.push(entity.id.clone());
                store.upsert(entity);
            }
            None => {
                report.added.push(entity.id.clone());
                store.upsert(entity);
            }
        }
    }

    for id in store.ids_for_device(interface_id, device_address) {
        if !incoming.contains(&id) {
            store.remove(&id);
            report.removed.push(id);
        }
    }
    report
}

/// Recompute the state of the given entities from the Value Cache.
/// Returns the ids whose state changed.
pub(crate) fn refresh_state(
    store: &EntityStore,
    values: &ValueCache,
    ids: &[EntityId],
    available: impl Fn(&Entity) -> bool,
) -> Vec<EntityId> {
    let mut changed = Vec::new();
    for id in ids {
        let Some(existing) = store.get(id) else {
            continue;
        };
        let mut next = (*existing).clone();
        fill_state(&mut next, values, available(&existing));
        if next != *existing {
            store.update(next);
            changed.push(id.clone());
        }
    }
    changed
}
