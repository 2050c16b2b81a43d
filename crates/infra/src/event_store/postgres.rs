//! Deprecated collaborator backend. This module exists only because some
//! deployments are mid-migration off Postgres onto the embedded SQLite
//! engine; it is feature-gated behind `postgres` and should not gain new
//! capability beyond what `SqliteLocalStore` already offers.
//!
//! Savepoint isolation here is real `SAVEPOINT`/`RELEASE`/`ROLLBACK TO`
//! against a single `sqlx::Transaction`, same shape as the SQLite backend.
//! Kept deliberately smaller: no connection pool tuning beyond `PgPoolOptions`
//! defaults, no prepared-statement cache policy decisions.

use chrono::{DateTime, Utc};
use commercebus_core::{AggregateId, ExpectedVersion};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use uuid::Uuid;

use super::model::{
    AggregateSnapshot, OutboxEntry, OutboxStatus, ProcessingRow, ProcessingStatus, StoredEvent,
};
use super::store_api::{
    LocalStore, LocalStoreError, Mutation, MutationResult, Submission, SubmissionOutcome,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    aggregate_id UUID NOT NULL,
    aggregate_type TEXT NOT NULL,
    version BIGINT NOT NULL,
    event_type TEXT NOT NULL,
    correlation_id UUID,
    occurred_at TIMESTAMPTZ NOT NULL,
    payload BYTEA NOT NULL,
    PRIMARY KEY (aggregate_id, version)
);

CREATE TABLE IF NOT EXISTS snapshots (
    aggregate_id UUID PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    correlation_id UUID,
    version BIGINT NOT NULL,
    payload BYTEA NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
    id UUID PRIMARY KEY,
    stream_name TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event BYTEA NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    dispatched_at TIMESTAMPTZ,
    processed_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS outbox_processing (
    outbox_id UUID NOT NULL,
    handler_id TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    next_retry_at TIMESTAMPTZ,
    PRIMARY KEY (outbox_id, handler_id)
);
"#;

/// This backend drives its async `sqlx` pool from synchronous trait methods
/// by blocking on the current Tokio runtime handle, the same bridging
/// pattern the outbox workers use when they must call into synchronous
/// `LocalStore` code from an async task.
pub struct PostgresLocalStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresLocalStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LocalStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
        Ok(Self { pool, handle: Handle::current() })
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| self.handle.block_on(fut))
    }
}

impl LocalStore for PostgresLocalStore {
    fn apply_batch(&self, submissions: &[Submission]) -> Vec<SubmissionOutcome> {
        self.block_on(async {
            let mut tx = match self.pool.begin().await {
                Ok(tx) => tx,
                Err(e) => {
                    return submissions
                        .iter()
                        .map(|_| Err(LocalStoreError::Backend(e.to_string())))
                        .collect()
                }
            };

            let mut outcomes = Vec::with_capacity(submissions.len());
            for (idx, submission) in submissions.iter().enumerate() {
                let savepoint = format!("sp_{idx}");
                if let Err(e) = sqlx::query(&format!("SAVEPOINT {savepoint}")).execute(&mut *tx).await {
                    outcomes.push(Err(LocalStoreError::Backend(e.to_string())));
                    continue;
                }

                let mut results = Vec::with_capacity(submission.mutations.len());
                let mut failure = None;
                for mutation in &submission.mutations {
                    match apply_mutation_sql(&mut tx, mutation).await {
                        Ok(r) => results.push(r),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }

                match failure {
                    Some(e) => {
                        let _ = sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                            .execute(&mut *tx)
                            .await;
                        outcomes.push(Err(e));
                    }
                    None => {
                        if let Err(e) =
                            sqlx::query(&format!("RELEASE SAVEPOINT {savepoint}")).execute(&mut *tx).await
                        {
                            outcomes.push(Err(LocalStoreError::Backend(e.to_string())));
                        } else {
                            outcomes.push(Ok(results));
                        }
                    }
                }
            }

            if let Err(e) = tx.commit().await {
                return submissions
                    .iter()
                    .map(|_| Err(LocalStoreError::Backend(e.to_string())))
                    .collect();
            }
            outcomes
        })
    }

    fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>, LocalStoreError> {
        self.block_on(async {
            sqlx::query(
                "SELECT aggregate_id, aggregate_type, correlation_id, version, payload FROM snapshots WHERE aggregate_id = $1",
            )
            .bind(*aggregate_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?
            .map(|row| {
                Ok(AggregateSnapshot {
                    aggregate_id,
                    aggregate_type: row.try_get("aggregate_type").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                    correlation_id: row.try_get("correlation_id").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                    version: row.try_get::<i64, _>("version").map_err(|e| LocalStoreError::Backend(e.to_string()))? as u64,
                    payload: row.try_get("payload").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                })
            })
            .transpose()
        })
    }

    fn events_after(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, LocalStoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT aggregate_type, version, event_type, correlation_id, occurred_at, payload
                 FROM events WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC",
            )
            .bind(*aggregate_id.as_uuid())
            .bind(from_version as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;

            rows.into_iter()
                .map(|row| {
                    Ok(StoredEvent {
                        aggregate_id,
                        aggregate_type: row.try_get("aggregate_type").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                        version: row.try_get::<i64, _>("version").map_err(|e| LocalStoreError::Backend(e.to_string()))? as u64,
                        event_type: row.try_get("event_type").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                        correlation_id: row.try_get("correlation_id").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                        occurred_at: row.try_get("occurred_at").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                        payload: row.try_get("payload").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
                    })
                })
                .collect()
        })
    }

    fn get_outbox(&self, id: Uuid) -> Result<Option<OutboxEntry>, LocalStoreError> {
        self.block_on(async {
            sqlx::query(
                "SELECT id, stream_name, event_type, event, status, attempts, created_at, dispatched_at, processed_at
                 FROM outbox WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?
            .map(row_to_outbox)
            .transpose()
        })
    }

    fn mark_outbox_dispatched(&self, id: Uuid) -> Result<(), LocalStoreError> {
        self.block_on(async {
            let result = sqlx::query(
                "UPDATE outbox SET status = 'dispatched', dispatched_at = now(), attempts = attempts + 1 WHERE id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            if result.rows_affected() == 0 {
                return Err(LocalStoreError::NotFound);
            }
            Ok(())
        })
    }

    fn mark_outbox_processed(&self, id: Uuid) -> Result<(), LocalStoreError> {
        self.block_on(async {
            let result = sqlx::query("UPDATE outbox SET status = 'processed', processed_at = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            if result.rows_affected() == 0 {
                return Err(LocalStoreError::NotFound);
            }
            Ok(())
        })
    }

    fn delete_outbox(&self, id: Uuid) -> Result<(), LocalStoreError> {
        self.block_on(async {
            sqlx::query("DELETE FROM outbox WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            Ok(())
        })
    }

    fn stuck_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT id, stream_name, event_type, event, status, attempts, created_at, dispatched_at, processed_at
                 FROM outbox WHERE status = 'pending' AND created_at < $1",
            )
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            rows.into_iter().map(row_to_outbox).collect()
        })
    }

    fn stuck_dispatched(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT id, stream_name, event_type, event, status, attempts, created_at, dispatched_at, processed_at
                 FROM outbox WHERE status = 'dispatched' AND dispatched_at < $1",
            )
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            rows.into_iter().map(row_to_outbox).collect()
        })
    }

    fn poller_ready(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT o.id, o.stream_name, o.event_type, o.event, o.status, o.attempts, o.created_at, o.dispatched_at, o.processed_at
                 FROM outbox o WHERE o.status = 'pending'
                 OR EXISTS (
                    SELECT 1 FROM outbox_processing p
                    WHERE p.outbox_id = o.id AND p.status = 'failed' AND p.next_retry_at <= $1
                 )",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            rows.into_iter().map(row_to_outbox).collect()
        })
    }

    fn move_to_undeliverable_dlq(&self, entry: &OutboxEntry, last_error: String) -> Result<(), LocalStoreError> {
        self.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS undeliverable_messages_dlq (
                    outbox_id UUID PRIMARY KEY, event BYTEA NOT NULL, attempts INTEGER NOT NULL,
                    last_error TEXT NOT NULL, created_at TIMESTAMPTZ NOT NULL)",
            )
            .execute(&mut *tx)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            sqlx::query(
                "INSERT INTO undeliverable_messages_dlq (outbox_id, event, attempts, last_error, created_at)
                 VALUES ($1, $2, $3, $4, now())",
            )
            .bind(entry.id)
            .bind(&entry.event)
            .bind(entry.attempts as i32)
            .bind(&last_error)
            .execute(&mut *tx)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            sqlx::query("DELETE FROM outbox WHERE id = $1")
                .bind(entry.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            tx.commit().await.map_err(|e| LocalStoreError::Backend(e.to_string()))
        })
    }

    fn get_processing_row(
        &self,
        outbox_id: Uuid,
        handler_id: &str,
    ) -> Result<Option<ProcessingRow>, LocalStoreError> {
        self.block_on(async {
            sqlx::query(
                "SELECT outbox_id, handler_id, status, retry_count, next_retry_at
                 FROM outbox_processing WHERE outbox_id = $1 AND handler_id = $2",
            )
            .bind(outbox_id)
            .bind(handler_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?
            .map(row_to_processing_row)
            .transpose()
        })
    }

    fn upsert_processing_row(&self, row: ProcessingRow) -> Result<(), LocalStoreError> {
        self.block_on(async {
            sqlx::query(
                "INSERT INTO outbox_processing (outbox_id, handler_id, status, retry_count, next_retry_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (outbox_id, handler_id) DO UPDATE SET
                    status = excluded.status, retry_count = excluded.retry_count, next_retry_at = excluded.next_retry_at",
            )
            .bind(row.outbox_id)
            .bind(&row.handler_id)
            .bind(row.status.as_str())
            .bind(row.retry_count as i32)
            .bind(row.next_retry_at)
            .execute(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            Ok(())
        })
    }

    fn processing_rows_for_outbox(&self, outbox_id: Uuid) -> Result<Vec<ProcessingRow>, LocalStoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT outbox_id, handler_id, status, retry_count, next_retry_at
                 FROM outbox_processing WHERE outbox_id = $1",
            )
            .bind(outbox_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            rows.into_iter().map(row_to_processing_row).collect()
        })
    }

    fn move_to_unprocessable_dlq(
        &self,
        outbox_id: Uuid,
        handler_id: String,
        event: Vec<u8>,
        attempts: u32,
        last_error: String,
    ) -> Result<(), LocalStoreError> {
        self.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS unprocessable_messages_dlq (
                    outbox_id UUID NOT NULL, handler_id TEXT NOT NULL, event BYTEA NOT NULL,
                    attempts INTEGER NOT NULL, last_error TEXT NOT NULL, created_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (outbox_id, handler_id))",
            )
            .execute(&mut *tx)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            sqlx::query(
                "INSERT INTO unprocessable_messages_dlq (outbox_id, handler_id, event, attempts, last_error, created_at)
                 VALUES ($1, $2, $3, $4, $5, now())
                 ON CONFLICT (outbox_id, handler_id) DO UPDATE SET
                    event = excluded.event, attempts = excluded.attempts, last_error = excluded.last_error",
            )
            .bind(outbox_id)
            .bind(&handler_id)
            .bind(&event)
            .bind(attempts as i32)
            .bind(&last_error)
            .execute(&mut *tx)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            sqlx::query("DELETE FROM outbox_processing WHERE outbox_id = $1 AND handler_id = $2")
                .bind(outbox_id)
                .bind(&handler_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            tx.commit().await.map_err(|e| LocalStoreError::Backend(e.to_string()))
        })
    }
}

fn row_to_outbox(row: sqlx::postgres::PgRow) -> Result<OutboxEntry, LocalStoreError> {
    let status: String = row.try_get("status").map_err(|e| LocalStoreError::Backend(e.to_string()))?;
    Ok(OutboxEntry {
        id: row.try_get("id").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        stream_name: row.try_get("stream_name").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        event_type: row.try_get("event_type").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        event: row.try_get("event").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Pending),
        attempts: row.try_get::<i32, _>("attempts").map_err(|e| LocalStoreError::Backend(e.to_string()))? as u32,
        created_at: row.try_get("created_at").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        dispatched_at: row.try_get("dispatched_at").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        processed_at: row.try_get("processed_at").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
    })
}

fn row_to_processing_row(row: sqlx::postgres::PgRow) -> Result<ProcessingRow, LocalStoreError> {
    let status: String = row.try_get("status").map_err(|e| LocalStoreError::Backend(e.to_string()))?;
    Ok(ProcessingRow {
        outbox_id: row.try_get("outbox_id").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        handler_id: row.try_get("handler_id").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
        status: ProcessingStatus::parse(&status).unwrap_or(ProcessingStatus::InFlight),
        retry_count: row.try_get::<i32, _>("retry_count").map_err(|e| LocalStoreError::Backend(e.to_string()))? as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(|e| LocalStoreError::Backend(e.to_string()))?,
    })
}

async fn apply_mutation_sql(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    mutation: &Mutation,
) -> Result<MutationResult, LocalStoreError> {
    match mutation {
        Mutation::AppendEvent { event, expected_version } => {
            let current: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = $1",
            )
            .bind(*event.aggregate_id.as_uuid())
            .fetch_one(&mut **tx)
            .await
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
            let insert = sqlx::query(
                "INSERT INTO events (aggregate_id, aggregate_type, version, event_type, correlation_id, occurred_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(*event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(version as i64)
            .bind(&event.event_type)
            .bind(event.correlation_id)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut **tx)
            .await;

            if let Err(e) = insert {
                return Err(if e.as_database_error().map(|d| d.is_unique_violation()).unwrap_or(false) {
                    LocalStoreError::VersionConflict {
                        aggregate_id: event.aggregate_id,
                        expected: version,
                        actual: current,
                    }
                } else {
                    LocalStoreError::Backend(e.to_string())
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
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM snapshots WHERE aggregate_id = $1",
            )
            .bind(*snapshot.aggregate_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            if let Some(existing_version) = existing {
                if (snapshot.version as i64) < existing_version {
                    return Err(LocalStoreError::InvalidAppend(format!(
                        "snapshot version {} is behind stored version {}",
                        snapshot.version, existing_version
                    )));
                }
            }
            sqlx::query(
                "INSERT INTO snapshots (aggregate_id, aggregate_type, correlation_id, version, payload)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (aggregate_id) DO UPDATE SET
                    aggregate_type = excluded.aggregate_type, correlation_id = excluded.correlation_id,
                    version = excluded.version, payload = excluded.payload",
            )
            .bind(*snapshot.aggregate_id.as_uuid())
            .bind(&snapshot.aggregate_type)
            .bind(snapshot.correlation_id)
            .bind(snapshot.version as i64)
            .bind(&snapshot.payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| LocalStoreError::Backend(e.to_string()))?;
            Ok(MutationResult::SnapshotSaved)
        }
        Mutation::AppendOutbox { id, stream_name, event_type, event } => {
            sqlx::query(
                "INSERT INTO outbox (id, stream_name, event_type, event, status, attempts, created_at)
                 VALUES ($1, $2, $3, $4, 'pending', 0, now())",
            )
            .bind(id)
            .bind(stream_name)
            .bind(event_type)
            .bind(event)
            .execute(&mut **tx)
            .await
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
