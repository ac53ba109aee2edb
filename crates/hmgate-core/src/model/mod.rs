// ── Domain model ──

pub mod address;
pub mod device;
pub mod entity;
pub mod value;

pub use device::Device;
pub use entity::{CustomKind, Entity, EntityField, EntityId, EntityKind, FieldRole};
pub use value::{CachedValue, Validity, ValueSource};
