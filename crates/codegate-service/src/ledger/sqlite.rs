//! SQLite-backed durable ledger.
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS quota_records (
//!     principal_id   TEXT    NOT NULL,
//!     resource_class TEXT    NOT NULL,
//!     count          INTEGER NOT NULL,
//!     quota_limit    INTEGER NOT NULL,
//!     period_start   INTEGER NOT NULL,
//!     period_end     INTEGER NOT NULL,
//!     PRIMARY KEY (principal_id, resource_class)
//! );
//! ```
//!
//! Consumption is a single `UPDATE ... WHERE count < quota_limit RETURNING`,
//! so the limit check and the increment happen inside one statement.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::{ConsumeOutcome, DurableLedger, LedgerError, QuotaRecord};
use crate::policy::ResourceClass;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS quota_records (
    principal_id   TEXT    NOT NULL,
    resource_class TEXT    NOT NULL,
    count          INTEGER NOT NULL,
    quota_limit    INTEGER NOT NULL,
    period_start   INTEGER NOT NULL,
    period_end     INTEGER NOT NULL,
    PRIMARY KEY (principal_id, resource_class)
);";

const COLUMNS: &str = "principal_id, resource_class, count, quota_limit, period_start, period_end";

/// Durable ledger in a local SQLite file.
///
/// Statements are serialized through one connection and run on the blocking
/// pool, keeping the async workers free.
#[derive(Clone)]
pub struct SqliteDurableLedger {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteDurableLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDurableLedger")
            .field("conn", &"<sqlite>")
            .finish()
    }
}

impl SqliteDurableLedger {
    /// Opens or creates the database at `path` in WAL mode.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        tracing::info!(path = %path.display(), "Opened sqlite durable ledger");
        Self::init(conn)
    }

    /// Private in-memory database, lost on drop.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let db = conn.lock();
            f(&db)
        })
        .await
        .map_err(|e| LedgerError::Task(e.to_string()))?
    }
}

/// Row as stored, before validation.
struct RawRecord {
    principal_id: String,
    resource_class: String,
    count: i64,
    limit: i64,
    period_start: i64,
    period_end: i64,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            principal_id: row.get(0)?,
            resource_class: row.get(1)?,
            count: row.get(2)?,
            limit: row.get(3)?,
            period_start: row.get(4)?,
            period_end: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<QuotaRecord, LedgerError> {
        let resource_class = ResourceClass::from_label(&self.resource_class).ok_or_else(|| {
            LedgerError::Corrupt(format!("unknown resource class {:?}", self.resource_class))
        })?;
        Ok(QuotaRecord {
            principal_id: self.principal_id,
            resource_class,
            count: from_sql_int(self.count, "count")?,
            limit: from_sql_int(self.limit, "quota_limit")?,
            period_start: from_sql_int(self.period_start, "period_start")?,
            period_end: from_sql_int(self.period_end, "period_end")?,
        })
    }
}

fn from_sql_int(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupt(format!("negative {column}: {value}")))
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn select_record(
    db: &Connection,
    principal_id: &str,
    class: ResourceClass,
) -> Result<Option<QuotaRecord>, LedgerError> {
    db.query_row(
        &format!(
            "SELECT {COLUMNS} FROM quota_records WHERE principal_id = ?1 AND resource_class = ?2"
        ),
        params![principal_id, class.label()],
        RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::into_record)
    .transpose()
}

fn require_record(
    db: &Connection,
    principal_id: &str,
    class: ResourceClass,
) -> Result<QuotaRecord, LedgerError> {
    select_record(db, principal_id, class)?
        .ok_or_else(|| LedgerError::Corrupt(format!("no record for {principal_id} / {class}")))
}

#[async_trait]
impl DurableLedger for SqliteDurableLedger {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn fetch(
        &self,
        principal_id: &str,
        class: ResourceClass,
    ) -> Result<Option<QuotaRecord>, LedgerError> {
        let principal_id = principal_id.to_string();
        self.with_conn(move |db| select_record(db, &principal_id, class))
            .await
    }

    async fn fetch_or_create(
        &self,
        principal_id: &str,
        class: ResourceClass,
        default_limit: u64,
        window_secs: u64,
        now: u64,
    ) -> Result<QuotaRecord, LedgerError> {
        let fresh = QuotaRecord::new(principal_id, class, default_limit, now, window_secs);
        self.with_conn(move |db| {
            db.execute(
                &format!(
                    "INSERT INTO quota_records ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (principal_id, resource_class) DO NOTHING"
                ),
                params![
                    fresh.principal_id,
                    class.label(),
                    to_sql_int(fresh.count),
                    to_sql_int(fresh.limit),
                    to_sql_int(fresh.period_start),
                    to_sql_int(fresh.period_end),
                ],
            )?;
            require_record(db, &fresh.principal_id, class)
        })
        .await
    }

    async fn store_reset(&self, reset: &QuotaRecord) -> Result<QuotaRecord, LedgerError> {
        let reset = reset.clone();
        self.with_conn(move |db| {
            let applied = db.execute(
                "UPDATE quota_records
                 SET count = 0, period_start = ?3, period_end = ?4
                 WHERE principal_id = ?1 AND resource_class = ?2 AND period_end < ?3",
                params![
                    reset.principal_id,
                    reset.resource_class.label(),
                    to_sql_int(reset.period_start),
                    to_sql_int(reset.period_end),
                ],
            )?;
            if applied > 0 {
                tracing::debug!(
                    principal = %reset.principal_id,
                    class = %reset.resource_class,
                    "Durable period reset"
                );
            }
            require_record(db, &reset.principal_id, reset.resource_class)
        })
        .await
    }

    async fn try_consume(&self, record: &QuotaRecord) -> Result<ConsumeOutcome, LedgerError> {
        let principal_id = record.principal_id.clone();
        let class = record.resource_class;
        self.with_conn(move |db| {
            let consumed = db
                .query_row(
                    &format!(
                        "UPDATE quota_records SET count = count + 1
                         WHERE principal_id = ?1 AND resource_class = ?2 AND count < quota_limit
                         RETURNING {COLUMNS}"
                    ),
                    params![principal_id, class.label()],
                    RawRecord::from_row,
                )
                .optional()?;
            match consumed {
                Some(raw) => Ok(ConsumeOutcome {
                    admitted: true,
                    record: raw.into_record()?,
                }),
                None => Ok(ConsumeOutcome {
                    admitted: false,
                    record: require_record(db, &principal_id, class)?,
                }),
            }
        })
        .await
    }

    async fn shutdown(&self) -> Result<(), LedgerError> {
        self.with_conn(|db| {
            db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
        .await
    }
}
