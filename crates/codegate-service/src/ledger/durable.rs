//! In-process durable ledger.
//!
//! Survives for the life of the process only. Used when no database path is
//! configured, and as the reference implementation in tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ConsumeOutcome, DurableLedger, LedgerError, QuotaRecord};
use crate::policy::ResourceClass;

type RecordKey = (String, ResourceClass);

/// Quota records keyed by (principal, resource class).
///
/// Conditional updates run under the record's shard lock, which gives the
/// same "increment iff count < limit" atomicity a database performs
/// server-side.
#[derive(Clone, Default)]
pub struct MemoryDurableLedger {
    records: Arc<DashMap<RecordKey, QuotaRecord>>,
}

impl MemoryDurableLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn key(principal_id: &str, class: ResourceClass) -> RecordKey {
    (principal_id.to_string(), class)
}

#[async_trait]
impl DurableLedger for MemoryDurableLedger {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn fetch(
        &self,
        principal_id: &str,
        class: ResourceClass,
    ) -> Result<Option<QuotaRecord>, LedgerError> {
        Ok(self
            .records
            .get(&key(principal_id, class))
            .map(|r| r.value().clone()))
    }

    async fn fetch_or_create(
        &self,
        principal_id: &str,
        class: ResourceClass,
        default_limit: u64,
        window_secs: u64,
        now: u64,
    ) -> Result<QuotaRecord, LedgerError> {
        let record = self
            .records
            .entry(key(principal_id, class))
            .or_insert_with(|| QuotaRecord::new(principal_id, class, default_limit, now, window_secs));
        Ok(record.value().clone())
    }

    async fn store_reset(&self, reset: &QuotaRecord) -> Result<QuotaRecord, LedgerError> {
        let mut stored = self
            .records
            .entry(key(&reset.principal_id, reset.resource_class))
            .or_insert_with(|| reset.clone());
        if stored.period_end < reset.period_start {
            stored.count = 0;
            stored.period_start = reset.period_start;
            stored.period_end = reset.period_end;
        }
        Ok(stored.value().clone())
    }

    async fn try_consume(&self, record: &QuotaRecord) -> Result<ConsumeOutcome, LedgerError> {
        let Some(mut stored) = self
            .records
            .get_mut(&key(&record.principal_id, record.resource_class))
        else {
            return Err(LedgerError::Corrupt(format!(
                "no record for {} / {}",
                record.principal_id, record.resource_class
            )));
        };

        let admitted = stored.count < stored.limit;
        if admitted {
            stored.count += 1;
        }
        Ok(ConsumeOutcome {
            admitted,
            record: stored.value().clone(),
        })
    }
}
