// ── Cached parameter values ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hmgate_api::Value;

/// Whether a cached value is known to reflect the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// Pushed by the backend or read back successfully.
    Confirmed,
    /// Restored from disk, or carried across a disconnect.
    Uncertain,
}

/// One value in the Value Cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub value: Value,
    pub validity: Validity,
    /// When the value was observed. For pulls this is when the request
    /// was issued, not when the answer arrived.
    pub updated_at: DateTime<Utc>,
}

impl CachedValue {
    pub fn is_confirmed(&self) -> bool {
        self.validity == Validity::Confirmed
    }
}

/// Where a proposed value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// `event` callback.
    Push,
    /// Answer to a `getValue` / `getParamset` call.
    Pull,
    /// Echo of a successful write.
    Write,
}
