//! `LocalStore`: the abstraction the Transaction Batcher and outbox workers
//! are built against, with two backends sharing identical semantics (an
//! embedded SQLite engine, canonical, and a deprecated Postgres
//! collaborator) plus an in-memory backend for tests. Callers cannot tell
//! the backends apart: every method returns the same model types, no
//! numeric row ids, no backend-specific sentinel fields.

use chrono::{DateTime, Utc};
use commercebus_core::{AggregateId, ExpectedVersion};
use thiserror::Error;
use uuid::Uuid;

use super::model::{
    AggregateSnapshot, OutboxEntry, ProcessingRow, StoredEvent, UncommittedEvent,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocalStoreError {
    #[error("version conflict for aggregate {aggregate_id}: expected {expected}, stream is at {actual}")]
    VersionConflict {
        aggregate_id: AggregateId,
        expected: u64,
        actual: u64,
    },
    #[error("not found")]
    NotFound,
    #[error("invalid append: {0}")]
    InvalidAppend(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// A single prepared mutation against the local store, as produced by a
/// Unit of Work callback. Grouping a batch of these into one `Submission`
/// is how the Transaction Batcher coalesces concurrent commit requests.
#[derive(Debug, Clone)]
pub enum Mutation {
    AppendEvent {
        event: UncommittedEvent,
        expected_version: ExpectedVersion,
    },
    SaveSnapshot(AggregateSnapshot),
    AppendOutbox {
        id: Uuid,
        stream_name: String,
        event_type: String,
        event: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub enum MutationResult {
    EventAppended(StoredEvent),
    SnapshotSaved,
    OutboxAppended(OutboxEntry),
}

/// One caller's set of mutations, submitted together and isolated from every
/// other submission in the same flush via a savepoint.
#[derive(Debug, Clone)]
pub struct Submission {
    pub mutations: Vec<Mutation>,
}

pub type SubmissionOutcome = Result<Vec<MutationResult>, LocalStoreError>;

pub trait LocalStore: Send + Sync {
    /// Apply each submission inside its own savepoint within one outer
    /// transaction: a submission whose mutations all succeed commits
    /// together with every other successful submission in the batch: a
    /// submission with a failing mutation is rolled back to its own
    /// savepoint boundary and contributes nothing, without affecting any
    /// other submission. Returns one outcome per input submission, same
    /// order.
    fn apply_batch(&self, submissions: &[Submission]) -> Vec<SubmissionOutcome>;

    fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>, LocalStoreError>;

    fn events_after(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, LocalStoreError>;

    fn get_outbox(&self, id: Uuid) -> Result<Option<OutboxEntry>, LocalStoreError>;

    fn mark_outbox_dispatched(&self, id: Uuid) -> Result<(), LocalStoreError>;

    fn mark_outbox_processed(&self, id: Uuid) -> Result<(), LocalStoreError>;

    fn delete_outbox(&self, id: Uuid) -> Result<(), LocalStoreError>;

    fn stuck_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError>;

    fn stuck_dispatched(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError>;

    fn poller_ready(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError>;

    fn move_to_undeliverable_dlq(&self, entry: &OutboxEntry, last_error: String) -> Result<(), LocalStoreError>;

    fn get_processing_row(
        &self,
        outbox_id: Uuid,
        handler_id: &str,
    ) -> Result<Option<ProcessingRow>, LocalStoreError>;

    fn upsert_processing_row(&self, row: ProcessingRow) -> Result<(), LocalStoreError>;

    fn processing_rows_for_outbox(&self, outbox_id: Uuid) -> Result<Vec<ProcessingRow>, LocalStoreError>;

    fn move_to_unprocessable_dlq(
        &self,
        outbox_id: Uuid,
        handler_id: String,
        event: Vec<u8>,
        attempts: u32,
        last_error: String,
    ) -> Result<(), LocalStoreError>;
}

impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    fn apply_batch(&self, submissions: &[Submission]) -> Vec<SubmissionOutcome> {
        (**self).apply_batch(submissions)
    }

    fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>, LocalStoreError> {
        (**self).load_snapshot(aggregate_id)
    }

    fn events_after(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, LocalStoreError> {
        (**self).events_after(aggregate_id, from_version)
    }

    fn get_outbox(&self, id: Uuid) -> Result<Option<OutboxEntry>, LocalStoreError> {
        (**self).get_outbox(id)
    }

    fn mark_outbox_dispatched(&self, id: Uuid) -> Result<(), LocalStoreError> {
        (**self).mark_outbox_dispatched(id)
    }

    fn mark_outbox_processed(&self, id: Uuid) -> Result<(), LocalStoreError> {
        (**self).mark_outbox_processed(id)
    }

    fn delete_outbox(&self, id: Uuid) -> Result<(), LocalStoreError> {
        (**self).delete_outbox(id)
    }

    fn stuck_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        (**self).stuck_pending(older_than)
    }

    fn stuck_dispatched(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        (**self).stuck_dispatched(older_than)
    }

    fn poller_ready(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        (**self).poller_ready(now)
    }

    fn move_to_undeliverable_dlq(&self, entry: &OutboxEntry, last_error: String) -> Result<(), LocalStoreError> {
        (**self).move_to_undeliverable_dlq(entry, last_error)
    }

    fn get_processing_row(
        &self,
        outbox_id: Uuid,
        handler_id: &str,
    ) -> Result<Option<ProcessingRow>, LocalStoreError> {
        (**self).get_processing_row(outbox_id, handler_id)
    }

    fn upsert_processing_row(&self, row: ProcessingRow) -> Result<(), LocalStoreError> {
        (**self).upsert_processing_row(row)
    }

    fn processing_rows_for_outbox(&self, outbox_id: Uuid) -> Result<Vec<ProcessingRow>, LocalStoreError> {
        (**self).processing_rows_for_outbox(outbox_id)
    }

    fn move_to_unprocessable_dlq(
        &self,
        outbox_id: Uuid,
        handler_id: String,
        event: Vec<u8>,
        attempts: u32,
        last_error: String,
    ) -> Result<(), LocalStoreError> {
        (**self).move_to_unprocessable_dlq(outbox_id, handler_id, event, attempts, last_error)
    }
}
