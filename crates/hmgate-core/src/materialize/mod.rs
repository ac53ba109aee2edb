// ── Device/Entity Materializer ──
//
// Turns cached descriptions into entities. Pure over its inputs: the same
// descriptions, rules, and schema table always yield the same entity set,
// which `sync` then applies to the EntityStore with upsert-then-prune.

mod sync;

use std::collections::{BTreeMap, BTreeSet};

use hmgate_api::ParameterDescription;

use crate::model::{Entity, EntityField, EntityId, EntityKind, FieldRole, Validity, address};
use crate::rules::RuleSet;
use crate::schema::{CustomPlan, SchemaTable};
use crate::store::{DescriptionCache, ValueCache};

pub use sync::SyncReport;
pub(crate) use sync::{refresh_state, sync_device};

/// Parameters that become event entities regardless of operations.
const EVENT_PREFIX: &str = "PRESS_";

/// `true` for push-only parameters such as button presses.
pub fn is_event_parameter(parameter: &str, description: &ParameterDescription) -> bool {
    parameter.starts_with(EVENT_PREFIX) || description.operations.is_event_only()
}

/// Read-only view over everything entity shape depends on.
pub struct Materializer<'a> {
    pub descriptions: &'a DescriptionCache,
    pub values: &'a ValueCache,
    pub rules: &'a RuleSet,
    pub schemas: &'a SchemaTable,
}

impl Materializer<'_> {
    /// Every entity a device should have, ordered by id.
    ///
    /// `available` is `false` while the interface is down or the device
    /// unreachable; all entities are then state-uncertain.
    pub fn device(&self, interface_id: &str, device_address: &str, available: bool) -> Vec<Entity> {
        let Some(root) = self.descriptions.device(device_address) else {
            return Vec::new();
        };
        let device_type = root.device_type.as_str();

        // channel address -> VALUES descriptions
        let channels: BTreeMap<String, BTreeMap<String, ParameterDescription>> = self
            .descriptions
            .channels_of(device_address)
            .into_iter()
            .map(|c| {
                let values = self.descriptions.values_of(&c.address);
                (c.address, values)
            })
            .collect();

        let plan = self.schemas.plan(device_type);
        let mut consumed: BTreeSet<(String, String)> = BTreeSet::new();
        let mut entities = Vec::new();

        // Custom entities first; their parameters are not materialized again.
        for custom in &plan.customs {
            if let Some(entity) =
                self.custom(interface_id, device_address, device_type, custom, &channels)
            {
                for (channel, parameter) in entity.backing() {
                    consumed.insert((channel.to_owned(), parameter.to_owned()));
                }
                entities.push(entity);
            }
        }

        let forced: BTreeSet<(String, &str)> = plan
            .forced
            .iter()
            .map(|(ch, p)| (address::channel_address(device_address, *ch), p.as_str()))
            .collect();

        for (channel_address, values) in &channels {
            let channel_no = address::channel_no(channel_address);
            for (parameter, description) in values {
                if consumed.contains(&(channel_address.clone(), parameter.clone())) {
                    continue;
                }
                let event = is_event_parameter(parameter, description);
                let included = self
                    .rules
                    .decide(device_type, channel_no, parameter, description.flags)
                    .is_included()
                    || (!event
                        && forced.contains(&(channel_address.clone(), parameter.as_str()))
                        && self
                            .rules
                            .decide_forced(device_type, channel_no, parameter)
                            .is_included());
                if !included {
                    continue;
                }

                let (kind, role) = if event {
                    (EntityKind::Event, FieldRole::Event)
                } else {
                    (EntityKind::Generic, FieldRole::Primary)
                };
                entities.push(Entity {
                    id: EntityId::generic(channel_address, parameter),
                    interface_id: interface_id.to_owned(),
                    device_address: device_address.to_owned(),
                    device_type: device_type.to_owned(),
                    kind,
                    fields: vec![EntityField {
                        name: parameter.to_ascii_lowercase(),
                        role,
                        channel_address: channel_address.clone(),
                        parameter: parameter.clone(),
                        value: None,
                    }],
                    last_updated: None,
                    uncertain: false,
                });
            }
        }

        for entity in &mut entities {
            fill_state(entity, self.values, available);
        }
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities.dedup_by(|a, b| a.id == b.id);
        entities
    }

    fn custom(
        &self,
        interface_id: &str,
        device_address: &str,
        device_type: &str,
        plan: &CustomPlan,
        channels: &BTreeMap<String, BTreeMap<String, ParameterDescription>>,
    ) -> Option<Entity> {
        let own = address::channel_address(device_address, plan.channel);
        if !channels.contains_key(&own) {
            return None;
        }

        let fields: Vec<EntityField> = plan
            .fields
            .iter()
            .filter_map(|field| {
                let channel_address = address::channel_address(device_address, field.channel);
                channels
                    .get(&channel_address)?
                    .get(&field.parameter)?;
                self.rules
                    .decide_forced(device_type, Some(field.channel), &field.parameter)
                    .is_included()
                    .then(|| EntityField {
                        name: field.name.clone(),
                        role: field.role,
                        channel_address,
                        parameter: field.parameter.clone(),
                        value: None,
                    })
            })
            .collect();

        // A schema whose own-channel fields are all missing does not fit
        // this channel.
        if !fields.iter().any(|f| f.channel_address == own) {
            return None;
        }

        Some(Entity {
            id: EntityId::custom(&own, plan.kind),
            interface_id: interface_id.to_owned(),
            device_address: device_address.to_owned(),
            device_type: device_type.to_owned(),
            kind: EntityKind::Custom(plan.kind),
            fields,
            last_updated: None,
            uncertain: false,
        })
    }
}

/// Copy cached values into an entity and derive its freshness flags.
pub(crate) fn fill_state(entity: &mut Entity, values: &ValueCache, available: bool) {
    let mut last_updated = None;
    let mut unconfirmed = false;
    for field in &mut entity.fields {
        match values.peek(&field.channel_address, &field.parameter) {
            Some(cached) => {
                unconfirmed |= cached.validity == Validity::Uncertain;
                last_updated = last_updated.max(Some(cached.updated_at));
                field.value = Some(cached.value);
            }
            None => field.value = None,
        }
    }
    entity.last_updated = last_updated;
    entity.uncertain = unconfirmed || !available;
}
