//! Custom-entity schemas and the device-type lookup table.
//!
//! A schema is a declarative composition rule: which channel is the
//! entity's own (primary, plus optional secondaries that each get an
//! entity of their own), which parameters it binds on that channel
//! (repeatable fields), and which it binds on fixed channels of the same
//! device. Device types map to a schema plus the *base channels* the
//! schema is rebased onto, one group per base.
//!
//! The table is data: [`SchemaTable::builtin`] covers common switch,
//! dimmer, cover, lock, and thermostat types, and [`SchemaTable::merge`]
//! layers TOML-loaded definitions on top.
//!
//! ```toml
//! [schema.my_relay]
//! kind = "switch"
//! primary_channel = 0
//! field = [
//!     { field = "state", parameter = "STATE" },
//!     { field = "temperature", parameter = "ACTUAL_TEMPERATURE", channel = 0, role = "sensor" },
//! ]
//!
//! [[device]]
//! device_type = "ACME-RELAY*"
//! schema = "my_relay"
//! channels = [1, 2]
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{CustomKind, FieldRole};
use crate::rules::Pattern;

// ── Declarative types ────────────────────────────────────────────────

/// One parameter bound into a custom entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Logical name commands and hosts refer to (`state`, `level`, ...).
    pub field: String,
    pub parameter: String,
    /// Fixed channel, relative to the base channel. `None` binds the
    /// parameter on the entity's own channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<FieldRole>,
}

impl FieldSpec {
    /// Declared role, or primary for own-channel fields and secondary
    /// for fixed-channel ones.
    pub fn role(&self) -> FieldRole {
        self.role.unwrap_or(if self.channel.is_none() {
            FieldRole::Primary
        } else {
            FieldRole::Secondary
        })
    }
}

/// Parameters on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParameters {
    pub channel: u32,
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub kind: CustomKind,
    pub primary_channel: u32,
    #[serde(default)]
    pub secondary_channels: Vec<u32>,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldSpec>,
    /// Generic entities created even if hidden, relative to the first
    /// base channel.
    #[serde(default)]
    pub additional_entities: Vec<ChannelParameters>,
    #[serde(default = "default_true")]
    pub include_default_entities: bool,
}

fn default_true() -> bool {
    true
}

fn default_base() -> Vec<u32> {
    vec![0]
}

/// Device type -> schema binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub device_type: Pattern,
    pub schema: String,
    /// Base channels; the schema is instantiated once per base.
    #[serde(default = "default_base")]
    pub channels: Vec<u32>,
    /// Extra generic entities for this device type, absolute channels.
    #[serde(default)]
    pub additional_entities: Vec<ChannelParameters>,
}

/// Contents of a schema TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default, rename = "schema")]
    pub schemas: BTreeMap<String, EntitySchema>,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceMapping>,
}

// ── Resolved plans ───────────────────────────────────────────────────

/// A field with its channel resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedField {
    pub name: String,
    pub role: FieldRole,
    pub channel: u32,
    pub parameter: String,
}

/// One custom entity a device should get, if its parameters exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomPlan {
    pub kind: CustomKind,
    /// The entity's own channel.
    pub channel: u32,
    pub fields: Vec<PlannedField>,
}

/// Everything the schema table says about one device type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePlan {
    pub customs: Vec<CustomPlan>,
    /// `(channel, parameter)` pairs materialized regardless of visibility.
    pub forced: Vec<(u32, String)>,
}

// ── SchemaTable ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTable {
    schemas: BTreeMap<String, EntitySchema>,
    devices: Vec<DeviceMapping>,
    default_entities: Vec<ChannelParameters>,
}

impl Default for SchemaTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemaTable {
    /// No schemas, no default entities.
    pub fn empty() -> Self {
        Self {
            schemas: BTreeMap::new(),
            devices: Vec::new(),
            default_entities: Vec::new(),
        }
    }

    pub fn builtin() -> Self {
        builtin::table()
    }

    /// Layer a schema file on top. Schemas replace same-named ones;
    /// device mappings take precedence over earlier ones of equal
    /// specificity.
    pub fn merge(&mut self, file: SchemaFile) {
        self.schemas.extend(file.schemas);
        self.devices.extend(file.devices);
    }

    pub fn schema(&self, name: &str) -> Option<&EntitySchema> {
        self.schemas.get(name)
    }

    /// Device mappings naming a schema that does not exist.
    pub fn dangling_mappings(&self) -> Vec<&DeviceMapping> {
        self.devices
            .iter()
            .filter(|m| !self.schemas.contains_key(&m.schema))
            .collect()
    }

    /// Mappings that apply to `device_type`: every mapping at the best
    /// specificity, one per schema name, later mappings replacing earlier.
    pub fn lookup(&self, device_type: &str) -> Vec<&DeviceMapping> {
        let rank = |m: &DeviceMapping| (m.device_type.specificity(), m.device_type.literal_len());
        let Some(best) = self
            .devices
            .iter()
            .filter(|m| m.device_type.matches(device_type))
            .map(rank)
            .max()
        else {
            return Vec::new();
        };

        let mut by_schema: BTreeMap<&str, &DeviceMapping> = BTreeMap::new();
        for mapping in self
            .devices
            .iter()
            .filter(|m| m.device_type.matches(device_type) && rank(m) == best)
        {
            by_schema.insert(mapping.schema.as_str(), mapping);
        }
        let mut found: Vec<&DeviceMapping> = by_schema.into_values().collect();
        found.sort_by_key(|m| m.channels.first().copied().unwrap_or_default());
        found
    }

    /// Resolve custom entities and forced parameters for a device type.
    pub fn plan(&self, device_type: &str) -> DevicePlan {
        let mut plan = DevicePlan::default();
        let mut include_defaults = true;

        for mapping in self.lookup(device_type) {
            let Some(schema) = self.schemas.get(&mapping.schema) else {
                continue;
            };
            include_defaults &= schema.include_default_entities;

            for &base in &mapping.channels {
                let primary = schema.primary_channel + base;
                let mut own_channels = vec![primary];
                for secondary in &schema.secondary_channels {
                    let ch = secondary + base;
                    if !own_channels.contains(&ch) {
                        own_channels.push(ch);
                    }
                }

                for own in own_channels {
                    let fields = schema
                        .fields
                        .iter()
                        .map(|spec| PlannedField {
                            name: spec.field.clone(),
                            role: spec.role(),
                            channel: spec.channel.map_or(own, |c| c + base),
                            parameter: spec.parameter.clone(),
                        })
                        .collect();
                    plan.customs.push(CustomPlan {
                        kind: schema.kind,
                        channel: own,
                        fields,
                    });
                }
            }

            let first_base = mapping.channels.first().copied().unwrap_or_default();
            for extra in &schema.additional_entities {
                push_forced(&mut plan.forced, extra.channel + first_base, &extra.parameters);
            }
            for extra in &mapping.additional_entities {
                push_forced(&mut plan.forced, extra.channel, &extra.parameters);
            }
        }

        if include_defaults {
            for defaults in &self.default_entities {
                push_forced(&mut plan.forced, defaults.channel, &defaults.parameters);
            }
        }
        plan
    }
}

fn push_forced(forced: &mut Vec<(u32, String)>, channel: u32, parameters: &[String]) {
    for parameter in parameters {
        let entry = (channel, parameter.clone());
        if !forced.contains(&entry) {
            forced.push(entry);
        }
    }
}

// ── Built-in table ───────────────────────────────────────────────────

mod builtin {
    use super::{ChannelParameters, DeviceMapping, EntitySchema, FieldSpec, SchemaTable};
    use crate::model::{CustomKind, FieldRole};
    use std::collections::BTreeMap;

    fn own(field: &str, parameter: &str) -> FieldSpec {
        FieldSpec {
            field: field.into(),
            parameter: parameter.into(),
            channel: None,
            role: None,
        }
    }

    fn own_sensor(field: &str, parameter: &str) -> FieldSpec {
        FieldSpec {
            role: Some(FieldRole::Sensor),
            ..own(field, parameter)
        }
    }

    fn fixed(channel: u32, field: &str, parameter: &str, role: FieldRole) -> FieldSpec {
        FieldSpec {
            field: field.into(),
            parameter: parameter.into(),
            channel: Some(channel),
            role: Some(role),
        }
    }

    fn params(channel: u32, parameters: &[&str]) -> ChannelParameters {
        ChannelParameters {
            channel,
            parameters: parameters.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    fn schema(kind: CustomKind, primary_channel: u32, fields: Vec<FieldSpec>) -> EntitySchema {
        EntitySchema {
            kind,
            primary_channel,
            secondary_channels: Vec::new(),
            fields,
            additional_entities: Vec::new(),
            include_default_entities: true,
        }
    }

    fn map(device_type: &str, schema: &str, channels: &[u32]) -> DeviceMapping {
        DeviceMapping {
            device_type: device_type.parse().unwrap_or_default(),
            schema: schema.into(),
            channels: channels.to_vec(),
            additional_entities: Vec::new(),
        }
    }

    fn schemas() -> BTreeMap<String, EntitySchema> {
        use CustomKind::{Climate, Cover, Dimmer, Lock, Switch};
        use FieldRole::{Primary, Sensor};

        let mut s = BTreeMap::new();

        s.insert("ip_switch".into(), EntitySchema {
            secondary_channels: vec![2, 3],
            additional_entities: vec![params(
                4,
                &[
                    "CURRENT",
                    "ENERGY_COUNTER",
                    "FREQUENCY",
                    "POWER",
                    "ACTUAL_TEMPERATURE",
                    "VOLTAGE",
                ],
            )],
            ..schema(Switch, 1, vec![
                own("state", "STATE"),
                own("on_time", "ON_TIME"),
                fixed(0, "channel_state", "STATE", Sensor),
            ])
        });
        s.insert("rf_switch".into(), EntitySchema {
            additional_entities: vec![params(
                1,
                &["CURRENT", "ENERGY_COUNTER", "FREQUENCY", "POWER", "VOLTAGE"],
            )],
            ..schema(Switch, 0, vec![own("state", "STATE"), own("on_time", "ON_TIME")])
        });

        s.insert("ip_dimmer".into(), EntitySchema {
            secondary_channels: vec![2, 3],
            ..schema(Dimmer, 1, vec![
                own("level", "LEVEL"),
                own("on_time", "ON_TIME"),
                own("ramp_time", "RAMP_TIME"),
                fixed(0, "channel_level", "LEVEL", Sensor),
            ])
        });
        s.insert(
            "rf_dimmer".into(),
            schema(Dimmer, 0, vec![
                own("level", "LEVEL"),
                own("on_time", "ON_TIME"),
                own("ramp_time", "RAMP_TIME"),
            ]),
        );

        s.insert(
            "ip_cover".into(),
            schema(Cover, 1, vec![
                own("level", "LEVEL"),
                own("level_2", "LEVEL_2"),
                own("stop", "STOP"),
                fixed(0, "direction", "ACTIVITY_STATE", Sensor),
                fixed(0, "channel_level", "LEVEL", Sensor),
                fixed(0, "channel_level_2", "LEVEL_2", Sensor),
            ]),
        );
        s.insert(
            "rf_cover".into(),
            schema(Cover, 0, vec![
                own_sensor("direction", "DIRECTION"),
                own("level", "LEVEL"),
                own("level_2", "LEVEL_SLATS"),
                own("stop", "STOP"),
            ]),
        );

        s.insert(
            "ip_lock".into(),
            schema(Lock, 1, vec![
                own_sensor("direction", "ACTIVITY_STATE"),
                own_sensor("lock_state", "LOCK_STATE"),
                own("lock_target_level", "LOCK_TARGET_LEVEL"),
                fixed(0, "error", "ERROR_JAMMED", Sensor),
            ]),
        );
        s.insert(
            "rf_lock".into(),
            schema(Lock, 0, vec![
                own_sensor("direction", "DIRECTION"),
                own("open", "OPEN"),
                own("state", "STATE"),
                own_sensor("error", "ERROR"),
            ]),
        );

        s.insert(
            "ip_thermostat".into(),
            schema(Climate, 0, vec![
                own("setpoint", "SET_POINT_TEMPERATURE"),
                own("active_profile", "ACTIVE_PROFILE"),
                own("boost_mode", "BOOST_MODE"),
                own("control_mode", "CONTROL_MODE"),
                own("heating_cooling", "HEATING_COOLING"),
                own("party_mode", "PARTY_MODE"),
                own("set_point_mode", "SET_POINT_MODE"),
                own_sensor("temperature_maximum", "TEMPERATURE_MAXIMUM"),
                own_sensor("temperature_minimum", "TEMPERATURE_MINIMUM"),
                own_sensor("humidity", "HUMIDITY"),
                own_sensor("temperature", "ACTUAL_TEMPERATURE"),
                fixed(0, "level", "LEVEL", Sensor),
                fixed(8, "state", "STATE", Sensor),
            ]),
        );
        s.insert(
            "rf_thermostat".into(),
            schema(Climate, 0, vec![
                own("setpoint", "SET_TEMPERATURE"),
                own("auto_mode", "AUTO_MODE"),
                own("boost_mode", "BOOST_MODE"),
                own("comfort_mode", "COMFORT_MODE"),
                own("control_mode", "CONTROL_MODE"),
                own("lowering_mode", "LOWERING_MODE"),
                own("manu_mode", "MANU_MODE"),
                own_sensor("temperature_maximum", "TEMPERATURE_MAXIMUM"),
                own_sensor("temperature_minimum", "TEMPERATURE_MINIMUM"),
                own_sensor("humidity", "ACTUAL_HUMIDITY"),
                own_sensor("temperature", "ACTUAL_TEMPERATURE"),
                fixed(0, "valve_state", "VALVE_STATE", Sensor),
            ]),
        );
        s.insert(
            "simple_rf_thermostat".into(),
            schema(Climate, 0, vec![
                own_sensor("humidity", "HUMIDITY"),
                own_sensor("temperature", "TEMPERATURE"),
                fixed(1, "setpoint", "SETPOINT", Primary),
            ]),
        );
        s
    }

    fn devices() -> Vec<DeviceMapping> {
        let mut d = vec![
            // Switches
            map("HmIP-BSM", "ip_switch", &[3]),
            map("HmIP-BSL", "ip_switch", &[3]),
            map("HmIP-BS2", "ip_switch", &[3, 7]),
            map("HmIP-FSI", "ip_switch", &[2]),
            map("HmIP-FSM", "ip_switch", &[1]),
            map("HmIP-PCBS", "ip_switch", &[2]),
            map("HmIP-PCBS2", "ip_switch", &[3, 7]),
            map("HmIP-PS", "ip_switch", &[2]),
            map("HmIP-USBSM", "ip_switch", &[2]),
            map("HmIP-WGC", "ip_switch", &[2]),
            map("HmIP-WHS2", "ip_switch", &[1, 5]),
            map("HmIPW-FIO6", "ip_switch", &[7, 11, 15, 19, 23, 27]),
            map("HM-LC-Sw*", "rf_switch", &[1, 2, 3, 4]),
            map("HM-ES-PM*", "rf_switch", &[1]),
            // Dimmers
            map("HmIP-BDT", "ip_dimmer", &[3]),
            map("HmIP-FDT", "ip_dimmer", &[1]),
            map("HmIP-PDT", "ip_dimmer", &[2]),
            map("HM-DW-WM", "rf_dimmer", &[1, 2, 3, 4]),
            map("HM-LC-Dim1T-DR", "rf_dimmer", &[1, 2, 3]),
            map("HM-LC-Dim1*", "rf_dimmer", &[1]),
            // Covers
            map("HmIP-BROLL", "ip_cover", &[3]),
            map("HmIP-FROLL", "ip_cover", &[3]),
            map("HmIP-BBL", "ip_cover", &[3]),
            map("HmIP-FBL", "ip_cover", &[3]),
            map("HM-LC-Bl1*", "rf_cover", &[0]),
            // Locks
            map("HmIP-DLD", "ip_lock", &[0]),
            map("HM-Sec-Key", "rf_lock", &[1]),
            // Thermostats
            map("HmIP-eTRV*", "ip_thermostat", &[1]),
            map("HmIP-BWTH", "ip_thermostat", &[1]),
            map("HmIP-STH", "ip_thermostat", &[1]),
            map("HmIP-WTH*", "ip_thermostat", &[1]),
            map("HmIPW-STH", "ip_thermostat", &[1]),
            map("HmIPW-WTH", "ip_thermostat", &[1]),
            map("ALPHA-IP-RBG", "ip_thermostat", &[1]),
            map("HM-CC-RT-DN", "rf_thermostat", &[4]),
            map("HM-TC-IT-WM-W-EU", "rf_thermostat", &[2]),
            map("BC-RT-TRX-Cy*", "rf_thermostat", &[1]),
            map("HM-CC-TC", "simple_rf_thermostat", &[1]),
        ];

        let variants = [("HmIP-DRSI1", vec![2]), ("HmIP-DRSI4", vec![5, 9, 13, 17])];
        for (device_type, channels) in variants {
            d.push(DeviceMapping {
                additional_entities: vec![params(0, &["ACTUAL_TEMPERATURE"])],
                ..map(device_type, "ip_switch", &channels)
            });
        }
        d
    }

    pub(super) fn table() -> SchemaTable {
        SchemaTable {
            schemas: schemas(),
            devices: devices(),
            default_entities: vec![
                params(0, &[
                    "DUTY_CYCLE",
                    "DUTYCYCLE",
                    "LOW_BAT",
                    "LOWBAT",
                    "OPERATING_VOLTAGE",
                    "RSSI_DEVICE",
                    "RSSI_PEER",
                    "SABOTAGE",
                ]),
                params(2, &["BATTERY_STATE"]),
                params(4, &["BATTERY_STATE"]),
            ],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtin_has_no_dangling_mappings() {
        let table = SchemaTable::builtin();
        assert!(table.dangling_mappings().is_empty());
    }

    #[test]
    fn ip_switch_is_rebased_per_base_channel() {
        let plan = SchemaTable::builtin().plan("HmIP-BS2");
        let channels: Vec<u32> = plan.customs.iter().map(|c| c.channel).collect();
        // Bases 3 and 7; primary 1, secondaries 2 and 3.
        assert_eq!(channels, vec![4, 5, 6, 8, 9, 10]);

        let first = &plan.customs[0];
        let state = first.fields.iter().find(|f| f.name == "state").unwrap();
        assert_eq!((state.channel, state.role), (4, FieldRole::Primary));
        let channel_state = first.fields.iter().find(|f| f.name == "channel_state").unwrap();
        assert_eq!((channel_state.channel, channel_state.role), (3, FieldRole::Sensor));

        // Additional entities follow the first base only.
        assert!(plan.forced.contains(&(7, "POWER".into())));
        assert!(plan.forced.contains(&(0, "RSSI_DEVICE".into())));
    }

    #[test]
    fn exact_mapping_beats_prefix() {
        let mut table = SchemaTable::builtin();
        table.merge(SchemaFile {
            schemas: BTreeMap::new(),
            devices: vec![DeviceMapping {
                device_type: "HmIP-*".parse().unwrap(),
                schema: "rf_switch".into(),
                channels: vec![0],
                additional_entities: Vec::new(),
            }],
        });

        let found = table.lookup("HmIP-PS");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].schema, "ip_switch");

        let found = table.lookup("HmIP-XYZ");
        assert_eq!(found[0].schema, "rf_switch");
    }

    #[test]
    fn unknown_device_gets_only_defaults() {
        let plan = SchemaTable::builtin().plan("HmIP-SWDO");
        assert!(plan.customs.is_empty());
        assert!(plan.forced.contains(&(2, "BATTERY_STATE".into())));
        assert!(SchemaTable::empty().plan("HmIP-SWDO").forced.is_empty());
    }

    #[test]
    fn schema_file_parses_and_overrides() {
        let file: SchemaFile = toml::from_str(
            r#"
            [schema.my_relay]
            kind = "switch"
            primary_channel = 0
            include_default_entities = false
            field = [
                { field = "state", parameter = "STATE" },
                { field = "temperature", parameter = "ACTUAL_TEMPERATURE", channel = 0, role = "sensor" },
            ]

            [[device]]
            device_type = "ACME-RELAY*"
            schema = "my_relay"
            channels = [1, 2]
            "#,
        )
        .unwrap();

        let mut table = SchemaTable::builtin();
        table.merge(file);
        let plan = table.plan("ACME-RELAY-2");
        assert_eq!(plan.customs.len(), 2);
        assert_eq!(plan.customs[1].channel, 2);
        assert_eq!(plan.customs[1].fields[1].channel, 2);
        assert!(plan.forced.is_empty());
    }
}
