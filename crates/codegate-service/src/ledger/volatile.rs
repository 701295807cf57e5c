//! In-process volatile ledger with TTL counters.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{LedgerError, VolatileDecision, VolatileLedger, VolatileUsage};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: u64,
}

impl Counter {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Per-process TTL counters.
///
/// Each increment runs under the key's shard lock, so increment-and-get is
/// atomic. Expired counters are recreated from zero on next use and swept by
/// [`VolatileLedger::cleanup`].
#[derive(Clone)]
pub struct MemoryVolatileLedger {
    counters: Arc<DashMap<String, Counter>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryVolatileLedger {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryVolatileLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl VolatileLedger for MemoryVolatileLedger {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn check_and_consume(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<VolatileDecision, LedgerError> {
        let now = self.clock.now_secs();
        let fresh = Counter {
            count: 0,
            expires_at: now.saturating_add(window_secs.max(1)),
        };

        let mut entry = self.counters.entry(key.to_string()).or_insert(fresh);
        let counter = entry.value_mut();
        if !counter.is_live(now) {
            *counter = fresh;
        }
        counter.count += 1;

        Ok(VolatileDecision::new(
            counter.count,
            limit,
            counter.expires_at.saturating_sub(now),
        ))
    }

    async fn peek(&self, key: &str) -> Result<Option<VolatileUsage>, LedgerError> {
        let now = self.clock.now_secs();
        Ok(self
            .counters
            .get(key)
            .filter(|c| c.is_live(now))
            .map(|c| VolatileUsage {
                count: c.count,
                reset_in_secs: c.expires_at.saturating_sub(now),
            }))
    }

    async fn cleanup(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.is_live(now));
        before.saturating_sub(self.counters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures_util::future::join_all;

    const DAY: u64 = 86_400;

    fn ledger() -> (MemoryVolatileLedger, ManualClock) {
        let clock = ManualClock::new(0);
        (MemoryVolatileLedger::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn limit_then_reject_then_reset() {
        let (ledger, clock) = ledger();

        let d = ledger.check_and_consume("k", 2, DAY).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);

        clock.set(10);
        let d = ledger.check_and_consume("k", 2, DAY).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);

        clock.set(20);
        let d = ledger.check_and_consume("k", 2, DAY).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reset_in_secs, 86_380);

        clock.set(86_401);
        let d = ledger.check_and_consume("k", 2, DAY).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.count, 1);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test]
    async fn huge_window_saturates_instead_of_wrapping() {
        let (ledger, clock) = ledger();
        clock.set(1_000);
        let d = ledger.check_and_consume("k", 2, u64::MAX).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.reset_in_secs, u64::MAX - 1_000);
        ledger.check_and_consume("k", 2, u64::MAX).await.unwrap();
        let d = ledger.check_and_consume("k", 2, u64::MAX).await.unwrap();
        assert!(!d.allowed);
    }

    #[tokio::test]
    async fn rejected_attempts_still_count() {
        let (ledger, _clock) = ledger();
        for _ in 0..5 {
            ledger.check_and_consume("k", 1, 60).await.unwrap();
        }
        let usage = ledger.peek("k").await.unwrap().unwrap();
        assert_eq!(usage.count, 5);
    }

    #[tokio::test]
    async fn expiry_is_set_only_on_creation() {
        let (ledger, clock) = ledger();
        ledger.check_and_consume("k", 10, 100).await.unwrap();
        clock.set(60);
        let d = ledger.check_and_consume("k", 10, 100).await.unwrap();
        // Second increment does not push the expiry out.
        assert_eq!(d.reset_in_secs, 40);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (ledger, _clock) = ledger();
        ledger.check_and_consume("a", 1, 60).await.unwrap();
        let d = ledger.check_and_consume("b", 1, 60).await.unwrap();
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn concurrent_increments_admit_exactly_limit() {
        let (ledger, _clock) = ledger();
        let attempts = (0..50).map(|_| ledger.check_and_consume("hot", 7, 60));
        let admitted = join_all(attempts)
            .await
            .into_iter()
            .filter(|d| d.as_ref().unwrap().allowed)
            .count();
        assert_eq!(admitted, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tasks_admit_exactly_limit() {
        let (ledger, _clock) = ledger();
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.check_and_consume("hot", 10, 60).await })
            })
            .collect();
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap().unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(ledger.peek("hot").await.unwrap().unwrap().count, 64);
    }

    #[tokio::test]
    async fn cleanup_drops_expired_counters() {
        let (ledger, clock) = ledger();
        ledger.check_and_consume("short", 1, 10).await.unwrap();
        ledger.check_and_consume("long", 1, 100).await.unwrap();
        clock.set(50);
        assert_eq!(ledger.cleanup().await, 1);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.peek("short").await.unwrap().is_none());
    }
}
