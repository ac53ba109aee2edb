// ── Value Cache ──
//
// Last-known parameter values per `(channel, parameter)`, gated by age.
// Pushes and pulls converge here through `apply`, which is
// last-writer-wins by observation time rather than arrival order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use hmgate_api::Value;

use crate::model::address;
use crate::model::{CachedValue, Validity};

/// Cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueKey {
    pub channel_address: String,
    pub parameter: String,
}

impl ValueKey {
    pub fn new(channel_address: &str, parameter: &str) -> Self {
        Self {
            channel_address: channel_address.to_owned(),
            parameter: parameter.to_owned(),
        }
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Fresh enough.
    Hit(CachedValue),
    /// Older than `max_age`, or the cache is disabled.
    Miss,
    /// Never recorded.
    NoCacheEntry,
}

/// What `apply` did with a proposed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A newer value is already cached.
    Rejected,
    /// Timestamp advanced; value and validity are the same.
    Unchanged,
    Changed,
}

impl ApplyOutcome {
    pub fn is_changed(self) -> bool {
        self == Self::Changed
    }
}

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedValue {
    #[serde(flatten)]
    pub key: ValueKey,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

pub struct ValueCache {
    enabled: bool,
    entries: DashMap<ValueKey, CachedValue>,
}

impl ValueCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Read a value no older than `max_age`.
    pub fn get(&self, channel_address: &str, parameter: &str, max_age: Duration) -> CacheLookup {
        self.get_at(channel_address, parameter, max_age, Utc::now())
    }

    /// [`get`](Self::get) against an explicit clock reading.
    pub fn get_at(
        &self,
        channel_address: &str,
        parameter: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }
        let Some(entry) = self.entries.get(&ValueKey::new(channel_address, parameter)) else {
            return CacheLookup::NoCacheEntry;
        };

        let age = now.signed_duration_since(entry.updated_at);
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        if age <= max_age {
            CacheLookup::Hit(entry.clone())
        } else {
            CacheLookup::Miss
        }
    }

    /// The cached entry regardless of age or the enabled flag.
    pub fn peek(&self, channel_address: &str, parameter: &str) -> Option<CachedValue> {
        self.entries
            .get(&ValueKey::new(channel_address, parameter))
            .map(|e| e.clone())
    }

    /// Unconditionally store `value`, stamped now.
    pub fn put(&self, channel_address: &str, parameter: &str, value: Value, validity: Validity) {
        self.put_at(channel_address, parameter, value, validity, Utc::now());
    }

    pub fn put_at(
        &self,
        channel_address: &str,
        parameter: &str,
        value: Value,
        validity: Validity,
        at: DateTime<Utc>,
    ) {
        self.entries.insert(
            ValueKey::new(channel_address, parameter),
            CachedValue {
                value,
                validity,
                updated_at: at,
            },
        );
    }

    /// Store `value` observed at `at` unless a newer value is cached.
    ///
    /// Equal timestamps are accepted, so re-applying the same observation
    /// leaves the cache as it was.
    pub fn apply(
        &self,
        channel_address: &str,
        parameter: &str,
        value: Value,
        validity: Validity,
        at: DateTime<Utc>,
    ) -> ApplyOutcome {
        let proposed = CachedValue {
            value,
            validity,
            updated_at: at,
        };

        match self.entries.entry(ValueKey::new(channel_address, parameter)) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(proposed);
                ApplyOutcome::Changed
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.updated_at > at {
                    return ApplyOutcome::Rejected;
                }
                let changed =
                    existing.value != proposed.value || existing.validity != proposed.validity;
                slot.insert(proposed);
                if changed {
                    ApplyOutcome::Changed
                } else {
                    ApplyOutcome::Unchanged
                }
            }
        }
    }

    /// Drop every entry of a device and its channels.
    pub fn invalidate(&self, device_address: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|k, _| !address::belongs_to(&k.channel_address, device_address));
        before - self.entries.len()
    }

    /// Drop one entry.
    pub fn remove(&self, channel_address: &str, parameter: &str) {
        self.entries.remove(&ValueKey::new(channel_address, parameter));
    }

    /// Flag values as uncertain, for one device or all of them.
    pub fn mark_uncertain(&self, device_address: Option<&str>) {
        for mut entry in self.entries.iter_mut() {
            if device_address.is_none_or(|d| address::belongs_to(&entry.key().channel_address, d)) {
                entry.validity = Validity::Uncertain;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub fn export(&self) -> Vec<PersistedValue> {
        let mut values: Vec<PersistedValue> = self
            .entries
            .iter()
            .map(|e| PersistedValue {
                key: e.key().clone(),
                value: e.value.clone(),
                updated_at: e.updated_at,
            })
            .collect();
        values.sort_by(|a, b| a.key.cmp(&b.key));
        values
    }

    /// Load persisted values. They are uncertain until the backend confirms them.
    pub fn restore(&self, values: Vec<PersistedValue>) {
        for v in values {
            self.entries.insert(
                v.key,
                CachedValue {
                    value: v.value,
                    validity: Validity::Uncertain,
                    updated_at: v.updated_at,
                },
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn put_then_get_with_zero_max_age_hits() {
        let cache = ValueCache::new(true);
        let now = ts(0);
        cache.put_at("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed, now);

        match cache.get_at("ABC123:1", "LEVEL", Duration::ZERO, now) {
            CacheLookup::Hit(v) => {
                assert_eq!(v.value, Value::Float(0.5));
                assert!(v.is_confirmed());
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn stale_is_miss_and_unknown_is_no_entry() {
        let cache = ValueCache::new(true);
        cache.put_at("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed, ts(0));

        assert_eq!(
            cache.get_at("ABC123:1", "LEVEL", Duration::from_secs(10), ts(11)),
            CacheLookup::Miss
        );
        assert!(matches!(
            cache.get_at("ABC123:1", "LEVEL", Duration::from_secs(10), ts(10)),
            CacheLookup::Hit(_)
        ));
        assert_eq!(
            cache.get_at("ABC123:1", "STATE", Duration::from_secs(10), ts(0)),
            CacheLookup::NoCacheEntry
        );
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = ValueCache::new(false);
        cache.put_at("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed, ts(0));
        assert_eq!(
            cache.get_at("ABC123:1", "LEVEL", Duration::from_secs(3600), ts(0)),
            CacheLookup::Miss
        );
        assert_eq!(
            cache.get_at("ABC123:1", "STATE", Duration::from_secs(3600), ts(0)),
            CacheLookup::Miss
        );
    }

    #[test]
    fn duplicate_apply_is_idempotent() {
        let cache = ValueCache::new(true);
        let first = cache.apply("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed, ts(5));
        let once = cache.export();
        let second =
            cache.apply("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed, ts(5));

        assert_eq!(first, ApplyOutcome::Changed);
        assert_eq!(second, ApplyOutcome::Unchanged);
        assert_eq!(cache.export(), once);
    }

    #[test]
    fn older_pull_does_not_clobber_newer_push() {
        let cache = ValueCache::new(true);
        cache.apply("ABC123:1", "LEVEL", Value::Float(0.8), Validity::Confirmed, ts(10));

        let stale = cache.apply("ABC123:1", "LEVEL", Value::Float(0.2), Validity::Confirmed, ts(9));
        assert_eq!(stale, ApplyOutcome::Rejected);
        assert_eq!(cache.peek("ABC123:1", "LEVEL").unwrap().value, Value::Float(0.8));

        let newer =
            cache.apply("ABC123:1", "LEVEL", Value::Float(0.3), Validity::Confirmed, ts(11));
        assert_eq!(newer, ApplyOutcome::Changed);
        assert_eq!(cache.peek("ABC123:1", "LEVEL").unwrap().value, Value::Float(0.3));
    }

    #[test]
    fn invalidate_only_touches_one_device() {
        let cache = ValueCache::new(true);
        cache.put("ABC123:0", "UNREACH", Value::Bool(false), Validity::Confirmed);
        cache.put("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed);
        cache.put("ABC1234:1", "LEVEL", Value::Float(0.1), Validity::Confirmed);

        assert_eq!(cache.invalidate("ABC123"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek("ABC1234:1", "LEVEL").is_some());
    }

    #[test]
    fn restored_values_are_uncertain() {
        let cache = ValueCache::new(true);
        cache.put_at("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed, ts(0));

        let other = ValueCache::new(true);
        other.restore(cache.export());
        let restored = other.peek("ABC123:1", "LEVEL").unwrap();
        assert_eq!(restored.validity, Validity::Uncertain);
        assert_eq!(restored.updated_at, ts(0));
    }

    #[test]
    fn mark_uncertain_scopes_to_device() {
        let cache = ValueCache::new(true);
        cache.put("ABC123:1", "LEVEL", Value::Float(0.5), Validity::Confirmed);
        cache.put("XYZ999:1", "LEVEL", Value::Float(0.1), Validity::Confirmed);

        cache.mark_uncertain(Some("ABC123"));
        assert!(!cache.peek("ABC123:1", "LEVEL").unwrap().is_confirmed());
        assert!(cache.peek("XYZ999:1", "LEVEL").unwrap().is_confirmed());

        cache.mark_uncertain(None);
        assert!(!cache.peek("XYZ999:1", "LEVEL").unwrap().is_confirmed());
    }
}
