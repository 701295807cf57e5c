//! Counter stores tracking consumption against quotas.
//!
//! Two ledger kinds with different guarantees:
//!
//! - [`VolatileLedger`]: fast TTL counters. Atomic increment-and-get, expiry
//!   set on first write, recreated from zero after expiry.
//! - [`DurableLedger`]: persistent per-(principal, class) records with
//!   explicit period bounds. Consumption is a single conditional update.
//!
//! The two windows for the same resource class are clocked independently:
//! a volatile counter starts at its first increment and expires by TTL, a
//! durable period starts at creation or reset. They are never synchronized;
//! when an action checks both, the stricter one governs.

mod durable;
#[cfg(feature = "redis")]
mod redis_store;
#[cfg(feature = "sqlite")]
mod sqlite;
mod volatile;

pub use durable::MemoryDurableLedger;
#[cfg(feature = "redis")]
pub use redis_store::RedisVolatileLedger;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDurableLedger;
pub use volatile::MemoryVolatileLedger;

use async_trait::async_trait;
use serde::Serialize;

use crate::policy::ResourceClass;

/// A counter store round trip failed.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "sqlite")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Blocking store task panicked or was cancelled.
    #[error("ledger task failed: {0}")]
    Task(String),

    /// Stored data could not be interpreted.
    #[error("corrupt ledger record: {0}")]
    Corrupt(String),
}

/// Outcome of one volatile increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatileDecision {
    pub allowed: bool,
    /// Post-increment value. Over-limit attempts are counted too.
    pub count: u64,
    pub remaining: u64,
    pub reset_in_secs: u64,
}

impl VolatileDecision {
    pub fn new(count: u64, limit: u64, reset_in_secs: u64) -> Self {
        Self {
            allowed: count <= limit,
            count,
            remaining: limit.saturating_sub(count),
            reset_in_secs,
        }
    }
}

/// Current state of a volatile counter, read without incrementing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatileUsage {
    pub count: u64,
    pub reset_in_secs: u64,
}

/// Fast TTL-based counter store.
#[async_trait]
pub trait VolatileLedger: Send + Sync {
    /// Short backend name for health output and logs.
    fn backend(&self) -> &'static str;

    /// Atomically increments `key`. If the increment created the key, its
    /// expiry is set to `window_secs`. `allowed` is false when the
    /// post-increment value exceeds `limit`; the increment still stands.
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<VolatileDecision, LedgerError>;

    async fn peek(&self, key: &str) -> Result<Option<VolatileUsage>, LedgerError>;

    /// Drops expired entries. Stores with native expiry return 0.
    async fn cleanup(&self) -> usize {
        0
    }

    async fn shutdown(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Persistent quota record, one per (principal, resource class).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub principal_id: String,
    pub resource_class: ResourceClass,
    pub count: u64,
    pub limit: u64,
    /// Unix seconds.
    pub period_start: u64,
    /// Unix seconds. Always greater than `period_start`.
    pub period_end: u64,
}

impl QuotaRecord {
    /// Fresh record with an empty period starting at `now`.
    pub fn new(
        principal_id: impl Into<String>,
        resource_class: ResourceClass,
        limit: u64,
        now: u64,
        window_secs: u64,
    ) -> Self {
        Self {
            principal_id: principal_id.into(),
            resource_class,
            count: 0,
            limit,
            period_start: now,
            period_end: now.saturating_add(window_secs.max(1)),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    pub fn reset_in_secs(&self, now: u64) -> u64 {
        self.period_end.saturating_sub(now)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.period_end
    }
}

/// Returns a reset copy of `record` if its period has ended, else an
/// unchanged copy. Pure; persisting the reset is [`DurableLedger::store_reset`].
pub fn reset_if_expired(record: &QuotaRecord, now: u64, window_secs: u64) -> QuotaRecord {
    if record.is_expired(now) {
        QuotaRecord {
            count: 0,
            period_start: now,
            period_end: now.saturating_add(window_secs.max(1)),
            ..record.clone()
        }
    } else {
        record.clone()
    }
}

/// Result of [`DurableLedger::try_consume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub admitted: bool,
    /// Stored record after the attempt.
    pub record: QuotaRecord,
}

/// Persistent counter store with explicit period bounds.
#[async_trait]
pub trait DurableLedger: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn fetch(
        &self,
        principal_id: &str,
        class: ResourceClass,
    ) -> Result<Option<QuotaRecord>, LedgerError>;

    /// Returns the stored record, creating it with `default_limit` and a
    /// period starting at `now` if none exists.
    async fn fetch_or_create(
        &self,
        principal_id: &str,
        class: ResourceClass,
        default_limit: u64,
        window_secs: u64,
        now: u64,
    ) -> Result<QuotaRecord, LedgerError>;

    /// Persists a record produced by [`reset_if_expired`]. Only applied if the
    /// stored period ended before `reset.period_start`, so concurrent resets
    /// of the same period collapse into one. Returns the stored record.
    async fn store_reset(&self, reset: &QuotaRecord) -> Result<QuotaRecord, LedgerError>;

    /// Increments the count iff `count < limit`, as one atomic conditional
    /// update. Never read-compare-write.
    async fn try_consume(&self, record: &QuotaRecord) -> Result<ConsumeOutcome, LedgerError>;

    async fn shutdown(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Volatile counter key for a principal and resource class.
pub fn volatile_key(principal_id: &str, class: ResourceClass) -> String {
    format!("quota:{}:{}", class.label(), principal_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(count: u64) -> QuotaRecord {
        QuotaRecord {
            principal_id: "u".into(),
            resource_class: ResourceClass::CodeConversion,
            count,
            limit: 5,
            period_start: 100,
            period_end: 200,
        }
    }

    #[test]
    fn reset_leaves_live_period_untouched() {
        let r = record(3);
        assert_eq!(reset_if_expired(&r, 150, 100), r);
        // The end instant itself is still inside the period.
        assert_eq!(reset_if_expired(&r, 200, 100), r);
    }

    #[test]
    fn period_end_saturates_at_the_far_future() {
        let fresh = QuotaRecord::new("u", ResourceClass::FileCreation, 5, 10, u64::MAX);
        assert_eq!(fresh.period_end, u64::MAX);
        assert!(!fresh.is_expired(u64::MAX));
        let reset = reset_if_expired(&record(5), 201, u64::MAX);
        assert_eq!(reset.period_end, u64::MAX);
        assert_eq!(reset.count, 0);
    }

    #[test]
    fn reset_starts_new_period_at_now() {
        let r = reset_if_expired(&record(5), 201, 100);
        assert_eq!(r.count, 0);
        assert_eq!(r.period_start, 201);
        assert_eq!(r.period_end, 301);
        assert_eq!(r.limit, 5);
    }

    #[test]
    fn reset_is_idempotent() {
        let once = reset_if_expired(&record(5), 500, 100);
        let twice = reset_if_expired(&once, 500, 100);
        assert_eq!(once, twice);
    }

    #[test]
    fn volatile_decision_counts_over_limit() {
        let d = VolatileDecision::new(3, 2, 10);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        let d = VolatileDecision::new(2, 2, 10);
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[test]
    fn key_includes_class_and_principal() {
        assert_eq!(
            volatile_key("guest:1.2.3.4", ResourceClass::CodeSuggestion),
            "quota:code_suggestion:guest:1.2.3.4"
        );
    }
}
