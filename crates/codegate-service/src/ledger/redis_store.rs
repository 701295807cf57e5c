//! Redis-backed volatile ledger, shared across gateway replicas.

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use super::{LedgerError, VolatileDecision, VolatileLedger, VolatileUsage};

/// Increment, set expiry on creation, report TTL. Runs server-side as one
/// unit. A key that somehow lost its expiry is given one again so a counter
/// can never become permanent.
const INCR_WITH_EXPIRY: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// TTL counters in Redis. Expiry is native, so [`VolatileLedger::cleanup`]
/// is a no-op.
#[derive(Clone)]
pub struct RedisVolatileLedger {
    conn: ConnectionManager,
    script: Script,
}

impl RedisVolatileLedger {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379`). The connection
    /// manager reconnects on its own after transient failures.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to redis volatile ledger");
        Ok(Self {
            conn,
            script: Script::new(INCR_WITH_EXPIRY),
        })
    }
}

fn ttl_secs(ttl: i64) -> u64 {
    u64::try_from(ttl).unwrap_or(0)
}

#[async_trait]
impl VolatileLedger for RedisVolatileLedger {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn check_and_consume(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<VolatileDecision, LedgerError> {
        let mut conn = self.conn.clone();
        let (count, ttl): (u64, i64) = self
            .script
            .key(key)
            .arg(window_secs.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(VolatileDecision::new(count, limit, ttl_secs(ttl)))
    }

    async fn peek(&self, key: &str) -> Result<Option<VolatileUsage>, LedgerError> {
        let mut conn = self.conn.clone();
        let (count, ttl): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .ttl(key)
            .query_async(&mut conn)
            .await?;
        Ok(count.map(|count| VolatileUsage {
            count,
            reset_in_secs: ttl_secs(ttl),
        }))
    }
}
