//! The canonical local engine: SQLite via `rusqlite` behind an `r2d2` pool,
//! WAL journaling, schema declared once at startup (idempotent re-init).
//!
//! Savepoint isolation mirrors the in-memory backend's semantics exactly:
//! `apply_batch` opens one outer transaction, gives each `Submission` its
//! own `SAVEPOINT`, and releases or rolls back that savepoint alone on
//! success/failure before moving to the next submission.

use chrono::{DateTime, TimeZone, Utc};
use commercebus_core::{AggregateId, ExpectedVersion};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::model::{
    AggregateSnapshot, OutboxEntry, OutboxStatus, ProcessingRow, ProcessingStatus, StoredEvent,
};
use super::store_api::{LocalStore, LocalStoreError, Mutation, MutationResult, Submission, SubmissionOutcome};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS events (
    aggregate_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    version INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    correlation_id TEXT,
    occurred_at INTEGER NOT NULL,
    payload BLOB NOT NULL,
    PRIMARY KEY (aggregate_id, version)
);

CREATE TABLE IF NOT EXISTS snapshots (
    aggregate_id TEXT PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    correlation_id TEXT,
    version INTEGER NOT NULL,
    payload BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY,
    stream_name TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event BLOB NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    dispatched_at INTEGER,
    processed_at INTEGER
);

CREATE TABLE IF NOT EXISTS outbox_processing (
    outbox_id TEXT NOT NULL,
    handler_id TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    next_retry_at INTEGER,
    PRIMARY KEY (outbox_id, handler_id)
);

CREATE TABLE IF NOT EXISTS undeliverable_messages_dlq (
    outbox_id TEXT PRIMARY KEY,
    event BLOB NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS unprocessable_messages_dlq (
    outbox_id TEXT NOT NULL,
    handler_id TEXT NOT NULL,
    event BLOB NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (outbox_id, handler_id)
);
"#;

pub struct SqliteLocalStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLocalStore {
    /// `path` may be a filesystem path or `:memory:`. Schema init is
    /// idempotent: re-running it against an existing database never drops
    /// data (every statement is `CREATE TABLE IF NOT EXISTS`).
    pub fn open(path: &str, max_pool_size: u32) -> Result<Self, LocalStoreError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(max_pool_size)
            .build(manager)
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        let conn = pool.get().map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, LocalStoreError> {
        self.pool.get().map_err(|e| LocalStoreError::Backend(e.to_string()))
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    Ok(OutboxEntry {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        stream_name: row.get(1)?,
        event_type: row.get(2)?,
        event: row.get(3)?,
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Pending),
        attempts: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        dispatched_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        processed_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
    })
}

const OUTBOX_COLUMNS: &str =
    "id, stream_name, event_type, event, status, attempts, created_at, dispatched_at, processed_at";

impl LocalStore for SqliteLocalStore {
    fn apply_batch(&self, submissions: &[Submission]) -> Vec<SubmissionOutcome> {
        let mut conn = match self.conn() {
            Ok(c) => c,
            Err(e) => return submissions.iter().map(|_| Err(e.clone())).collect(),
        };

        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(e) => return submissions.iter().map(|_| Err(LocalStoreError::Backend(e.to_string()))).collect(),
        };

        let mut outcomes = Vec::with_capacity(submissions.len());

        for (idx, submission) in submissions.iter().enumerate() {
            let savepoint_name = format!("sp_{idx}");
            let savepoint = match tx.savepoint_with_name(&savepoint_name) {
                Ok(sp) => sp,
                Err(e) => {
                    outcomes.push(Err(LocalStoreError::Backend(e.to_string())));
                    continue;
                }
            };

            let mut results = Vec::with_capacity(submission.mutations.len());
            let mut failure = None;

            for mutation in &submission.mutations {
                match apply_mutation_sql(&savepoint, mutation) {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            match failure {
                Some(e) => {
                    let _ = savepoint.rollback();
                    outcomes.push(Err(e));
                }
                None => {
                    if let Err(e) = savepoint.commit() {
                        outcomes.push(Err(LocalStoreError::Backend(e.to_string())));
                    } else {
                        outcomes.push(Ok(results));
                    }
                }
            }
        }

        if let Err(e) = tx.commit() {
            // The outer commit failed: every submission in this flush is
            // unresolved. Surface the same backend error to all of them
            // rather than reporting partial success.
            return submissions
                .iter()
                .map(|_| Err(LocalStoreError::Backend(e.to_string())))
                .collect();
        }

        outcomes
    }

    fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>, LocalStoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT aggregate_id, aggregate_type, correlation_id, version, payload FROM snapshots WHERE aggregate_id = ?1",
            params![aggregate_id.to_string()],
            |row| {
                let correlation_id: Option<String> = row.get(2)?;
                Ok(AggregateSnapshot {
                    aggregate_id,
                    aggregate_type: row.get(1)?,
                    correlation_id: correlation_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    version: row.get(3)?,
                    payload: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn events_after(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, LocalStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT aggregate_id, aggregate_type, version, event_type, correlation_id, occurred_at, payload
                 FROM events WHERE aggregate_id = ?1 AND version > ?2 ORDER BY version ASC",
            )
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![aggregate_id.to_string(), from_version as i64], |row| {
                let correlation_id: Option<String> = row.get(4)?;
                Ok(StoredEvent {
                    aggregate_id,
                    aggregate_type: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u64,
                    event_type: row.get(3)?,
                    correlation_id: correlation_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    occurred_at: from_millis(row.get(5)?),
                    payload: row.get(6)?,
                })
            })
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn get_outbox(&self, id: Uuid) -> Result<Option<OutboxEntry>, LocalStoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = ?1"),
            params![id.to_string()],
            row_to_outbox,
        )
        .optional()
        .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn mark_outbox_dispatched(&self, id: Uuid) -> Result<(), LocalStoreError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE outbox SET status = 'dispatched', dispatched_at = ?2, attempts = attempts + 1 WHERE id = ?1",
                params![id.to_string(), millis(Utc::now())],
            )
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        if updated == 0 {
            return Err(LocalStoreError::NotFound);
        }
        Ok(())
    }

    fn mark_outbox_processed(&self, id: Uuid) -> Result<(), LocalStoreError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE outbox SET status = 'processed', processed_at = ?2 WHERE id = ?1",
                params![id.to_string(), millis(Utc::now())],
            )
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        if updated == 0 {
            return Err(LocalStoreError::NotFound);
        }
        Ok(())
    }

    fn delete_outbox(&self, id: Uuid) -> Result<(), LocalStoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id.to_string()])
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn stuck_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'pending' AND created_at < ?1"
            ))
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![millis(older_than)], row_to_outbox)
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn stuck_dispatched(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'dispatched' AND dispatched_at < ?1"
            ))
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![millis(older_than)], row_to_outbox)
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn poller_ready(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox o WHERE o.status = 'pending'
                 OR EXISTS (
                    SELECT 1 FROM outbox_processing p
                    WHERE p.outbox_id = o.id AND p.status = 'failed' AND p.next_retry_at <= ?1
                 )"
            ))
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![millis(now)], row_to_outbox)
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn move_to_undeliverable_dlq(&self, entry: &OutboxEntry, last_error: String) -> Result<(), LocalStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO undeliverable_messages_dlq (outbox_id, event, attempts, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id.to_string(),
                entry.event,
                entry.attempts,
                last_error,
                millis(Utc::now())
            ],
        )
        .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![entry.id.to_string()])
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get_processing_row(
        &self,
        outbox_id: Uuid,
        handler_id: &str,
    ) -> Result<Option<ProcessingRow>, LocalStoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT outbox_id, handler_id, status, retry_count, next_retry_at
             FROM outbox_processing WHERE outbox_id = ?1 AND handler_id = ?2",
            params![outbox_id.to_string(), handler_id],
            row_to_processing_row,
        )
        .optional()
        .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn upsert_processing_row(&self, row: ProcessingRow) -> Result<(), LocalStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO outbox_processing (outbox_id, handler_id, status, retry_count, next_retry_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(outbox_id, handler_id) DO UPDATE SET
                status = excluded.status, retry_count = excluded.retry_count, next_retry_at = excluded.next_retry_at",
            params![
                row.outbox_id.to_string(),
                row.handler_id,
                row.status.as_str(),
                row.retry_count,
                row.next_retry_at.map(millis),
            ],
        )
        .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn processing_rows_for_outbox(&self, outbox_id: Uuid) -> Result<Vec<ProcessingRow>, LocalStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT outbox_id, handler_id, status, retry_count, next_retry_at
                 FROM outbox_processing WHERE outbox_id = ?1",
            )
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![outbox_id.to_string()], row_to_processing_row)
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| LocalStoreError::Backend(e.to_string()))
    }

    fn move_to_unprocessable_dlq(
        &self,
        outbox_id: Uuid,
        handler_id: String,
        event: Vec<u8>,
        attempts: u32,
        last_error: String,
    ) -> Result<(), LocalStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO unprocessable_messages_dlq
             (outbox_id, handler_id, event, attempts, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                outbox_id.to_string(),
                handler_id.clone(),
                event,
                attempts,
                last_error,
                millis(Utc::now())
            ],
        )
        .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        conn.execute(
            "DELETE FROM outbox_processing WHERE outbox_id = ?1 AND handler_id = ?2",
            params![outbox_id.to_string(), handler_id],
        )
        .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

fn row_to_processing_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessingRow> {
    let outbox_id: String = row.get(0)?;
    let status: String = row.get(2)?;
    Ok(ProcessingRow {
        outbox_id: Uuid::parse_str(&outbox_id).unwrap_or_else(|_| Uuid::nil()),
        handler_id: row.get(1)?,
        status: ProcessingStatus::parse(&status).unwrap_or(ProcessingStatus::InFlight),
        retry_count: row.get(3)?,
        next_retry_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
    })
}

fn apply_mutation_sql(
    conn: &rusqlite::Connection,
    mutation: &Mutation,
) -> Result<MutationResult, LocalStoreError> {
    match mutation {
        Mutation::AppendEvent { event, expected_version } => {
            let current: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?1",
                    params![event.aggregate_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            let current = current as u64;
            if !expected_version.matches(current) {
                return Err(LocalStoreError::VersionConflict {
                    aggregate_id: event.aggregate_id,
                    expected: match expected_version {
                        ExpectedVersion::Exact(v) => *v,
                        ExpectedVersion::Any => current,
                    },
                    actual: current,
                });
            }
            let version = current + 1;
            let insert = conn.execute(
                "INSERT INTO events (aggregate_id, aggregate_type, version, event_type, correlation_id, occurred_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.aggregate_id.to_string(),
                    event.aggregate_type,
                    version as i64,
                    event.event_type,
                    event.correlation_id.map(|c| c.to_string()),
                    millis(event.occurred_at),
                    event.payload,
                ],
            );
            if let Err(e) = insert {
                // A uniqueness violation on (aggregate_id, version) racing
                // with our own precheck still surfaces as a version conflict.
                return Err(match &e {
                    rusqlite::Error::SqliteFailure(err, _)
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        LocalStoreError::VersionConflict {
                            aggregate_id: event.aggregate_id,
                            expected: version,
                            actual: current,
                        }
                    }
                    other => LocalStoreError::Backend(other.to_string()),
                });
            }

            Ok(MutationResult::EventAppended(StoredEvent {
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type.clone(),
                version,
                event_type: event.event_type.clone(),
                correlation_id: event.correlation_id,
                occurred_at: event.occurred_at,
                payload: event.payload.clone(),
            }))
        }
        Mutation::SaveSnapshot(snapshot) => {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT version FROM snapshots WHERE aggregate_id = ?1",
                    params![snapshot.aggregate_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            if let Some(existing_version) = existing {
                if (snapshot.version as i64) < existing_version {
                    return Err(LocalStoreError::InvalidAppend(format!(
                        "snapshot version {} is behind stored version {}",
                        snapshot.version, existing_version
                    )));
                }
            }
            conn.execute(
                "INSERT INTO snapshots (aggregate_id, aggregate_type, correlation_id, version, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(aggregate_id) DO UPDATE SET
                    aggregate_type = excluded.aggregate_type,
                    correlation_id = excluded.correlation_id,
                    version = excluded.version,
                    payload = excluded.payload",
                params![
                    snapshot.aggregate_id.to_string(),
                    snapshot.aggregate_type,
                    snapshot.correlation_id.map(|c| c.to_string()),
                    snapshot.version as i64,
                    snapshot.payload,
                ],
            )
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            Ok(MutationResult::SnapshotSaved)
        }
        Mutation::AppendOutbox { id, stream_name, event_type, event } => {
            conn.execute(
                "INSERT INTO outbox (id, stream_name, event_type, event, status, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
                params![id.to_string(), stream_name, event_type, event, millis(Utc::now())],
            )
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            Ok(MutationResult::OutboxAppended(OutboxEntry {
                id: *id,
                stream_name: stream_name.clone(),
                event_type: event_type.clone(),
                event: event.clone(),
                status: OutboxStatus::Pending,
                attempts: 0,
                created_at: Utc::now(),
                dispatched_at: None,
                processed_at: None,
            }))
        }
    }
}
