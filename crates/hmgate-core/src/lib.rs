//! Domain layer between `hmgate-api` and host applications.
//!
//! - **[`Central`]**: lifecycle and command surface. [`start()`](Central::start)
//!   restores persisted caches, binds the callback listener and connects
//!   every interface; per-interface background tasks then apply pushed
//!   events, probe health, and serialize writes.
//!
//! - **Caches** ([`store`]): the [`ValueCache`] (last-writer-wins by
//!   timestamp), the [`DescriptionCache`], and the file-backed
//!   [`PersistentStore`]. Only the central's apply tasks mutate them.
//!
//! - **Materialization** ([`materialize`], [`rules`], [`schema`]): devices
//!   become entities under the ignore/un-ignore [`RuleSet`] and the
//!   custom-entity [`SchemaTable`].
//!
//! - **Reactive access** ([`stream`]): [`EntityStream`] for whole snapshots,
//!   [`EntitySubscription`] for one entity's state changes.

pub mod central;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod materialize;
pub mod model;
pub mod rules;
pub mod schema;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use central::{Central, CentralEvent};
pub use command::{EntityCommand, FieldWrite};
pub use config::{
    CacheConfig, CentralConfig, HealthConfig, InterfaceConfig, RequestConfig, TlsVerification,
};
pub use error::CoreError;
pub use health::ConnectionState;
pub use materialize::Materializer;
pub use model::{
    CachedValue, CustomKind, Device, Entity, EntityField, EntityId, EntityKind, FieldRole,
    Validity, ValueSource,
};
pub use rules::{Pattern, Rule, RuleSet};
pub use schema::{SchemaFile, SchemaTable};
pub use store::{CacheLookup, DescriptionCache, EntityStore, PersistentStore, ValueCache};
pub use stream::{EntityStream, EntitySubscription};

pub use hmgate_api::{Credentials, ParamsetKind, Value};
