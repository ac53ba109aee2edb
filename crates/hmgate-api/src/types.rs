// ── Wire data model ──
//
// Device, channel, and parameter descriptions exactly as backends send
// them (upper-case keys), plus the loosely-typed parameter `Value`.
// Both protocol variants and the callback listener decode into these.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ── Paramset kinds ───────────────────────────────────────────────────

/// Named group of parameters on a channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ParamsetKind {
    /// Live values (state, measurements, actions).
    Values,
    /// Device configuration.
    Master,
    /// Direct-link configuration between devices.
    Link,
}

// ── Parameter types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ParameterType {
    Float,
    Integer,
    Bool,
    Enum,
    String,
    /// Write-only trigger, usually sent as `true`.
    Action,
}

// ── Operations / flags bitmasks ──────────────────────────────────────

/// `OPERATIONS` bitmask of a parameter description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operations(pub u8);

impl Operations {
    pub const READ: u8 = 1;
    pub const WRITE: u8 = 2;
    pub const EVENT: u8 = 4;

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn is_event(self) -> bool {
        self.0 & Self::EVENT != 0
    }

    /// Pushes events but can be neither read nor written (buttons).
    pub fn is_event_only(self) -> bool {
        self.is_event() && !self.is_readable() && !self.is_writable()
    }
}

/// `FLAGS` bitmask of a parameter or device description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u16);

impl Flags {
    pub const VISIBLE: u16 = 0x01;
    pub const INTERNAL: u16 = 0x02;
    pub const TRANSFORM: u16 = 0x04;
    pub const SERVICE: u16 = 0x08;
    pub const STICKY: u16 = 0x10;

    pub fn is_visible(self) -> bool {
        self.0 & Self::VISIBLE != 0
    }

    pub fn is_internal(self) -> bool {
        self.0 & Self::INTERNAL != 0
    }
}

impl Default for Flags {
    fn default() -> Self {
        Self(Self::VISIBLE)
    }
}

// ── Value ────────────────────────────────────────────────────────────

/// A parameter value as carried on the wire.
///
/// Variant order matters for untagged decoding: `1` decodes as
/// `Integer`, `0.5` as `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a loosely-typed value into the representation `ty` calls for.
    ///
    /// Legacy backends report most values as strings (`"0.500000"`,
    /// `"true"`, `"1"`). Returns `None` if the value cannot be read as `ty`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::as_conversions
    )]
    pub fn coerce(&self, ty: ParameterType) -> Option<Self> {
        match (ty, self) {
            (ParameterType::Bool | ParameterType::Action, Self::Bool(_)) => Some(self.clone()),
            (ParameterType::Bool | ParameterType::Action, Self::Integer(i)) => {
                Some(Self::Bool(*i != 0))
            }
            (ParameterType::Bool | ParameterType::Action, Self::String(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Some(Self::Bool(true)),
                    "false" | "0" | "" => Some(Self::Bool(false)),
                    _ => None,
                }
            }
            (ParameterType::Integer | ParameterType::Enum, Self::Integer(_)) => {
                Some(self.clone())
            }
            (ParameterType::Integer | ParameterType::Enum, Self::Float(f)) if f.fract() == 0.0 => {
                Some(Self::Integer(*f as i64))
            }
            (ParameterType::Integer | ParameterType::Enum, Self::String(s)) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| {
                        trimmed
                            .parse::<f64>()
                            .ok()
                            .filter(|f| f.fract() == 0.0)
                            .map(|f| f as i64)
                    })
                    .map(Self::Integer)
            }
            (ParameterType::Float, Self::Float(_)) => Some(self.clone()),
            (ParameterType::Float, Self::Integer(i)) => Some(Self::Float(*i as f64)),
            (ParameterType::Float, Self::String(s)) => s.trim().parse().ok().map(Self::Float),
            (ParameterType::String, Self::String(_)) => Some(self.clone()),
            (ParameterType::String, other) => Some(Self::String(other.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

// ── Descriptions ─────────────────────────────────────────────────────

/// A named special value outside the regular `MIN..MAX` range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct SpecialValue {
    pub id: String,
    pub value: Value,
}

/// Immutable schema of one parameter in one channel's paramset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ParameterDescription {
    #[serde(rename = "TYPE")]
    pub kind: ParameterType,
    #[serde(default)]
    pub operations: Operations,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special: Option<Vec<SpecialValue>>,
}

/// Parameter id -> description for one channel and paramset kind.
pub type ParamsetDescription = BTreeMap<String, ParameterDescription>;

/// Parameter id -> value for one channel and paramset kind.
pub type Paramset = BTreeMap<String, Value>;

/// Description of a device or one of its channels.
///
/// Devices have no `PARENT` (or an empty one) and list their channel
/// addresses in `CHILDREN`; channels carry `PARENT` and `INDEX`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeviceDescription {
    pub address: String,
    #[serde(rename = "TYPE")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub paramsets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub flags: Flags,
}

impl DeviceDescription {
    /// `true` for a device root, `false` for one of its channels.
    pub fn is_device(&self) -> bool {
        self.parent.as_deref().is_none_or(str::is_empty)
    }

    /// Paramset kinds this entry offers; unknown kinds are skipped.
    pub fn paramset_kinds(&self) -> Vec<ParamsetKind> {
        self.paramsets
            .iter()
            .filter_map(|p| ParamsetKind::from_str(p).ok())
            .collect()
    }
}

/// `{ADDRESS, VERSION}` pair the callback listener reports back on `listDevices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct DeviceSummary {
    pub address: String,
    pub version: u32,
}

// ── Tests ────────────────────────────────────────────────────────────
