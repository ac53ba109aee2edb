// ── Entity domain types ──
//
// Entities are what the host renders: either one parameter (generic,
// event) or several parameters composed by a schema (custom).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use hmgate_api::Value;

// ── EntityId ────────────────────────────────────────────────────────

/// Stable entity identifier.
///
/// Generic and event entities use `{channel_address}/{PARAMETER}`;
/// custom entities use `{device_address}:{channel}/{kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn generic(channel_address: &str, parameter: &str) -> Self {
        Self(format!("{channel_address}/{parameter}"))
    }

    pub fn custom(channel_address: &str, kind: CustomKind) -> Self {
        Self(format!("{channel_address}/{kind}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Kinds and roles ─────────────────────────────────────────────────

/// Logical device abstraction a custom schema produces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CustomKind {
    Switch,
    Dimmer,
    Cover,
    Lock,
    Climate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    /// One readable/writable parameter.
    Generic,
    /// A push-only parameter such as a button press.
    Event,
    Custom(CustomKind),
}

/// What a parameter contributes to a custom entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// Main controllable parameter on the entity's own channel.
    Primary,
    /// Supporting parameter on a fixed channel of the same device.
    Secondary,
    /// Read-only measurement or status.
    Sensor,
    Event,
}

// ── Entity ──────────────────────────────────────────────────────────

/// One parameter backing an entity, with its current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityField {
    /// Logical field name (`state`, `level`, `setpoint`, ...). Generic
    /// entities use the lower-cased parameter name.
    pub name: String,
    pub role: FieldRole,
    pub channel_address: String,
    pub parameter: String,
    pub value: Option<Value>,
}

/// A materialized entity.
///
/// Identity is the backing parameter set; only values, `last_updated`
/// and `uncertain` change over the entity's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub interface_id: String,
    pub device_address: String,
    pub device_type: String,
    pub kind: EntityKind,
    pub fields: Vec<EntityField>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Any backing value is unconfirmed, or the interface or device is down.
    pub uncertain: bool,
}

impl Entity {
    pub fn field(&self, name: &str) -> Option<&EntityField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Value of a named field, if the field exists and has a value.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.field(name).and_then(|f| f.value.as_ref())
    }

    /// `true` if this entity reads or writes `(channel_address, parameter)`.
    pub fn is_backed_by(&self, channel_address: &str, parameter: &str) -> bool {
        self.fields
            .iter()
            .any(|f| f.channel_address == channel_address && f.parameter == parameter)
    }

    /// The `(channel, parameter)` pairs behind this entity, in field order.
    pub fn backing(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|f| (f.channel_address.as_str(), f.parameter.as_str()))
    }

    /// `true` if both entities are backed by the same parameters in the
    /// same roles.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.fields.len() == other.fields.len()
            && self.fields.iter().zip(&other.fields).all(|(a, b)| {
                a.name == b.name
                    && a.role == b.role
                    && a.channel_address == b.channel_address
                    && a.parameter == b.parameter
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_formats() {
        assert_eq!(EntityId::generic("ABC123:1", "LEVEL").as_str(), "ABC123:1/LEVEL");
        assert_eq!(
            EntityId::custom("ABC123:4", CustomKind::Switch).to_string(),
            "ABC123:4/switch"
        );
    }

    #[test]
    fn custom_kind_is_lowercase_on_the_wire() {
        let json =
            serde_json::to_string(&EntityKind::Custom(CustomKind::Climate)).unwrap_or_default();
        assert_eq!(json, r#"{"type":"custom","kind":"climate"}"#);
    }
}
