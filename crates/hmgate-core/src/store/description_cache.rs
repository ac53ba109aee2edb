// ── Description Cache ──
//
// Device/channel descriptions and per-channel paramset descriptions.
// Fetched once per device lifetime; dropped only on device removal or
// an explicit reload.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use hmgate_api::{
    DeviceDescription, DeviceSummary, ParameterDescription, ParamsetDescription, ParamsetKind,
};

use crate::model::address;

/// Serializable form of the whole cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptionSnapshot {
    pub descriptions: Vec<DeviceDescription>,
    pub paramsets: Vec<PersistedParamset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedParamset {
    pub address: String,
    pub kind: ParamsetKind,
    pub parameters: ParamsetDescription,
}

pub struct DescriptionCache {
    /// Device roots and channels, keyed by address.
    descriptions: DashMap<String, DeviceDescription>,
    paramsets: DashMap<(String, ParamsetKind), Arc<ParamsetDescription>>,
    /// `{ADDRESS, VERSION}` of every device root, for the callback listener.
    known: watch::Sender<Arc<Vec<DeviceSummary>>>,
}

impl Default for DescriptionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptionCache {
    pub fn new() -> Self {
        let (known, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            descriptions: DashMap::new(),
            paramsets: DashMap::new(),
            known,
        }
    }

    // ── Descriptions ─────────────────────────────────────────────────

    /// Store descriptions of devices and/or channels.
    pub fn insert_descriptions(&self, descriptions: impl IntoIterator<Item = DeviceDescription>) {
        let mut roots_changed = false;
        for desc in descriptions {
            roots_changed |= desc.is_device();
            self.descriptions.insert(desc.address.clone(), desc);
        }
        if roots_changed {
            self.publish_known();
        }
    }

    pub fn description(&self, address: &str) -> Option<DeviceDescription> {
        self.descriptions.get(address).map(|d| d.clone())
    }

    /// The device root description.
    pub fn device(&self, device_address: &str) -> Option<DeviceDescription> {
        self.description(device_address).filter(DeviceDescription::is_device)
    }

    /// Device type of the device a channel belongs to.
    pub fn device_type_of(&self, channel_address: &str) -> Option<String> {
        self.descriptions
            .get(address::device_address(channel_address))
            .map(|d| d.device_type.clone())
    }

    /// Channel descriptions of a device, ordered by channel number.
    pub fn channels_of(&self, device_address: &str) -> Vec<DeviceDescription> {
        let mut channels: Vec<DeviceDescription> = self
            .descriptions
            .iter()
            .filter(|d| !d.is_device() && address::belongs_to(d.key(), device_address))
            .map(|d| d.clone())
            .collect();
        channels.sort_by_key(|c| c.index.or_else(|| address::channel_no(&c.address)));
        channels
    }

    /// Addresses of every known device root, sorted.
    pub fn device_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .descriptions
            .iter()
            .filter(|d| d.is_device())
            .map(|d| d.key().clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub fn contains_device(&self, device_address: &str) -> bool {
        self.device(device_address).is_some()
    }

    // ── Paramset descriptions ────────────────────────────────────────

    pub fn insert_paramset(
        &self,
        address: &str,
        kind: ParamsetKind,
        paramset: ParamsetDescription,
    ) {
        self.paramsets
            .insert((address.to_owned(), kind), Arc::new(paramset));
    }

    pub fn paramset(&self, address: &str, kind: ParamsetKind) -> Option<Arc<ParamsetDescription>> {
        self.paramsets
            .get(&(address.to_owned(), kind))
            .map(|p| Arc::clone(p.value()))
    }

    pub fn parameter(
        &self,
        address: &str,
        kind: ParamsetKind,
        parameter: &str,
    ) -> Option<ParameterDescription> {
        self.paramsets
            .get(&(address.to_owned(), kind))
            .and_then(|p| p.get(parameter).cloned())
    }

    /// `true` once every paramset the device's channels advertise is cached.
    pub fn is_complete(&self, device_address: &str) -> bool {
        if !self.contains_device(device_address) {
            return false;
        }
        self.channels_of(device_address).iter().all(|channel| {
            channel
                .paramset_kinds()
                .into_iter()
                .all(|kind| self.paramsets.contains_key(&(channel.address.clone(), kind)))
        })
    }

    // ── Removal ──────────────────────────────────────────────────────

    /// Drop a device with all its channels and paramsets.
    pub fn remove_device(&self, device_address: &str) -> bool {
        let existed = self.descriptions.contains_key(device_address);
        self.descriptions
            .retain(|addr, _| !address::belongs_to(addr, device_address));
        self.paramsets
            .retain(|(addr, _), _| !address::belongs_to(addr, device_address));
        if existed {
            self.publish_known();
        }
        existed
    }

    // ── Listener feed ────────────────────────────────────────────────

    /// Receiver for the callback listener's `listDevices` reply.
    pub fn known_devices(&self) -> watch::Receiver<Arc<Vec<DeviceSummary>>> {
        self.known.subscribe()
    }

    fn publish_known(&self) {
        let mut summaries: Vec<DeviceSummary> = self
            .descriptions
            .iter()
            .filter(|d| d.is_device())
            .map(|d| DeviceSummary {
                address: d.address.clone(),
                version: d.version,
            })
            .collect();
        summaries.sort_by(|a, b| a.address.cmp(&b.address));
        self.known.send_replace(Arc::new(summaries));
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub fn export(&self) -> DescriptionSnapshot {
        let mut descriptions: Vec<DeviceDescription> =
            self.descriptions.iter().map(|d| d.clone()).collect();
        descriptions.sort_by(|a, b| a.address.cmp(&b.address));

        let mut paramsets: Vec<PersistedParamset> = self
            .paramsets
            .iter()
            .map(|p| PersistedParamset {
                address: p.key().0.clone(),
                kind: p.key().1,
                parameters: (**p.value()).clone(),
            })
            .collect();
        paramsets.sort_by(|a, b| (&a.address, a.kind).cmp(&(&b.address, b.kind)));

        DescriptionSnapshot {
            descriptions,
            paramsets,
        }
    }

    pub fn import(&self, snapshot: DescriptionSnapshot) {
        self.insert_descriptions(snapshot.descriptions);
        for p in snapshot.paramsets {
            self.insert_paramset(&p.address, p.kind, p.parameters);
        }
    }

    /// Per-parameter view of a channel's VALUES, for materialization.
    pub fn values_of(&self, channel_address: &str) -> BTreeMap<String, ParameterDescription> {
        self.paramset(channel_address, ParamsetKind::Values)
            .map(|p| (*p).clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desc(value: serde_json::Value) -> DeviceDescription {
        serde_json::from_value(value).unwrap()
    }

    fn switch_device() -> Vec<DeviceDescription> {
        vec![
            desc(json!({
                "ADDRESS": "ABC123", "TYPE": "HmIP-PS",
                "CHILDREN": ["ABC123:0", "ABC123:3"], "PARAMSETS": ["MASTER"], "VERSION": 2
            })),
            desc(json!({
                "ADDRESS": "ABC123:3", "TYPE": "SWITCH_VIRTUAL_RECEIVER", "PARENT": "ABC123",
                "INDEX": 3, "PARAMSETS": ["VALUES"]
            })),
            desc(json!({
                "ADDRESS": "ABC123:0", "TYPE": "MAINTENANCE", "PARENT": "ABC123",
                "INDEX": 0, "PARAMSETS": ["VALUES"]
            })),
        ]
    }

    fn state_paramset() -> ParamsetDescription {
        serde_json::from_value(json!({
            "STATE": { "TYPE": "BOOL", "OPERATIONS": 7, "FLAGS": 1 }
        }))
        .unwrap()
    }

    #[test]
    fn channels_are_ordered_and_completeness_tracked() {
        let cache = DescriptionCache::new();
        cache.insert_descriptions(switch_device());

        let channels: Vec<String> = cache
            .channels_of("ABC123")
            .into_iter()
            .map(|c| c.address)
            .collect();
        assert_eq!(channels, vec!["ABC123:0", "ABC123:3"]);
        assert!(!cache.is_complete("ABC123"));

        cache.insert_paramset("ABC123:0", ParamsetKind::Values, ParamsetDescription::new());
        cache.insert_paramset("ABC123:3", ParamsetKind::Values, state_paramset());
        assert!(cache.is_complete("ABC123"));
        assert!(cache.parameter("ABC123:3", ParamsetKind::Values, "STATE").is_some());
    }

    #[test]
    fn remove_device_cascades() {
        let cache = DescriptionCache::new();
        cache.insert_descriptions(switch_device());
        cache.insert_paramset("ABC123:3", ParamsetKind::Values, state_paramset());

        assert!(cache.remove_device("ABC123"));
        assert!(cache.description("ABC123:3").is_none());
        assert!(cache.paramset("ABC123:3", ParamsetKind::Values).is_none());
        assert!(!cache.remove_device("ABC123"));
    }

    #[test]
    fn known_devices_follow_roots() {
        let cache = DescriptionCache::new();
        let rx = cache.known_devices();
        cache.insert_descriptions(switch_device());
        assert_eq!(
            **rx.borrow(),
            vec![DeviceSummary {
                address: "ABC123".into(),
                version: 2
            }]
        );

        cache.remove_device("ABC123");
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn export_import_restores_everything() {
        let cache = DescriptionCache::new();
        cache.insert_descriptions(switch_device());
        cache.insert_paramset("ABC123:3", ParamsetKind::Values, state_paramset());

        let other = DescriptionCache::new();
        other.import(cache.export());
        assert_eq!(other.export(), cache.export());
        assert_eq!(other.device_type_of("ABC123:3").as_deref(), Some("HmIP-PS"));
    }
}
