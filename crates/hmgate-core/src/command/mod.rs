// ── Command API ──
//
// Host writes flow through typed commands. Raw parameter writes go out
// as-is after validation; entity commands are first resolved against the
// entity's fields into one or more parameter writes.

mod validate;

use std::time::Duration;

use strum::Display;
use tokio::sync::oneshot;

use hmgate_api::{Paramset, ParamsetKind, Value};

use crate::error::CoreError;
use crate::model::{CustomKind, Entity, EntityKind};

pub use validate::validate_write;

/// A command envelope sent through an interface's command channel.
pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub response_tx: oneshot::Sender<Result<(), CoreError>>,
}

/// Validated outbound writes, executed one at a time per interface.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    /// Parameter writes sent in order; the first failure stops the rest.
    Write { writes: Vec<FieldWrite> },
    PutParamset {
        address: String,
        kind: ParamsetKind,
        values: Paramset,
    },
}

/// High-level operations on custom (and simple generic) entities.
#[derive(Debug, Clone, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EntityCommand {
    /// Switch on, open a cover, or dim to full. `on_time` switches off
    /// again after that long, where the device supports it.
    TurnOn { on_time: Option<Duration> },
    TurnOff,
    /// `0.0..=1.0` for dimmers and covers.
    SetLevel(f64),
    Stop,
    Lock,
    Unlock,
    Open,
    SetTemperature(f64),
}

/// One parameter write an entity command resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub channel_address: String,
    pub parameter: String,
    pub value: Value,
}

/// `LOCK_TARGET_LEVEL` values of IP locks.
const LOCK_TARGET_LOCKED: i64 = 0;
const LOCK_TARGET_UNLOCKED: i64 = 1;
const LOCK_TARGET_OPEN: i64 = 2;

/// Translate an entity command into parameter writes, in the order they
/// must be sent.
pub fn resolve(entity: &Entity, command: &EntityCommand) -> Result<Vec<FieldWrite>, CoreError> {
    let mut writes = Writes::new(entity);

    match (entity.kind, command) {
        (EntityKind::Custom(CustomKind::Switch), EntityCommand::TurnOn { on_time }) => {
            writes.on_time(*on_time);
            writes.set("state", true)?;
        }
        (EntityKind::Custom(CustomKind::Switch), EntityCommand::TurnOff) => {
            writes.set("state", false)?;
        }

        (EntityKind::Custom(CustomKind::Dimmer), EntityCommand::TurnOn { on_time }) => {
            writes.on_time(*on_time);
            writes.set("level", 1.0)?;
        }
        (EntityKind::Custom(CustomKind::Dimmer | CustomKind::Cover), EntityCommand::TurnOff) => {
            writes.set("level", 0.0)?;
        }
        (
            EntityKind::Custom(CustomKind::Dimmer | CustomKind::Cover),
            EntityCommand::SetLevel(level),
        ) => {
            if !(0.0..=1.0).contains(level) {
                return Err(CoreError::InvalidParameter {
                    message: format!("level {level} is outside 0.0..=1.0"),
                });
            }
            writes.set("level", *level)?;
        }

        (
            EntityKind::Custom(CustomKind::Cover),
            EntityCommand::TurnOn { .. } | EntityCommand::Open,
        ) => {
            writes.set("level", 1.0)?;
        }
        (EntityKind::Custom(CustomKind::Cover), EntityCommand::Stop) => {
            writes.set("stop", true)?;
        }

        (EntityKind::Custom(CustomKind::Lock), EntityCommand::Lock) => {
            if writes.has("lock_target_level") {
                writes.set("lock_target_level", LOCK_TARGET_LOCKED)?;
            } else {
                writes.set("state", false)?;
            }
        }
        (EntityKind::Custom(CustomKind::Lock), EntityCommand::Unlock) => {
            if writes.has("lock_target_level") {
                writes.set("lock_target_level", LOCK_TARGET_UNLOCKED)?;
            } else {
                writes.set("state", true)?;
            }
        }
        (EntityKind::Custom(CustomKind::Lock), EntityCommand::Open) => {
            if writes.has("lock_target_level") {
                writes.set("lock_target_level", LOCK_TARGET_OPEN)?;
            } else {
                writes.set("open", true)?;
            }
        }

        (EntityKind::Custom(CustomKind::Climate), EntityCommand::SetTemperature(celsius)) => {
            let bound = |name: &str| entity.value(name).and_then(Value::as_f64);
            if let Some(min) = bound("temperature_minimum") {
                if *celsius < min {
                    return Err(CoreError::InvalidParameter {
                        message: format!("{celsius} is below the minimum setpoint {min}"),
                    });
                }
            }
            if let Some(max) = bound("temperature_maximum") {
                if *celsius > max {
                    return Err(CoreError::InvalidParameter {
                        message: format!("{celsius} is above the maximum setpoint {max}"),
                    });
                }
            }
            writes.set("setpoint", *celsius)?;
        }

        // Single-parameter entities understand the obvious commands.
        (EntityKind::Generic, EntityCommand::TurnOn { .. }) => writes.set_only(true)?,
        (EntityKind::Generic, EntityCommand::TurnOff) => writes.set_only(false)?,
        (EntityKind::Generic, EntityCommand::SetLevel(level)) => writes.set_only(*level)?,

        (kind, command) => {
            return Err(CoreError::Unsupported {
                operation: format!("{command} on {} entity {}", kind_name(kind), entity.id),
            });
        }
    }

    Ok(writes.into_inner())
}

fn kind_name(kind: EntityKind) -> String {
    match kind {
        EntityKind::Generic => "generic".into(),
        EntityKind::Event => "event".into(),
        EntityKind::Custom(custom) => custom.to_string(),
    }
}

/// Accumulates writes against an entity's named fields.
struct Writes<'a> {
    entity: &'a Entity,
    out: Vec<FieldWrite>,
}

impl<'a> Writes<'a> {
    fn new(entity: &'a Entity) -> Self {
        Self {
            entity,
            out: Vec::new(),
        }
    }

    fn has(&self, name: &str) -> bool {
        self.entity.field(name).is_some()
    }

    fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), CoreError> {
        let field = self.entity.field(name).ok_or_else(|| CoreError::Unsupported {
            operation: format!("entity {} has no {name} field", self.entity.id),
        })?;
        self.out.push(FieldWrite {
            channel_address: field.channel_address.clone(),
            parameter: field.parameter.clone(),
            value: value.into(),
        });
        Ok(())
    }

    /// Write the single field of a generic entity.
    fn set_only(&mut self, value: impl Into<Value>) -> Result<(), CoreError> {
        let Some(field) = self.entity.fields.first() else {
            return Err(CoreError::Unsupported {
                operation: format!("entity {} has no fields", self.entity.id),
            });
        };
        self.out.push(FieldWrite {
            channel_address: field.channel_address.clone(),
            parameter: field.parameter.clone(),
            value: value.into(),
        });
        Ok(())
    }

    fn on_time(&mut self, on_time: Option<Duration>) {
        if let Some(on_time) = on_time {
            if self.has("on_time") {
                // Infallible: presence checked above.
                let _ = self.set("on_time", on_time.as_secs_f64());
            }
        }
    }

    fn into_inner(self) -> Vec<FieldWrite> {
        self.out
    }
}
