//! Data model for the local event store: events, snapshots, and the outbox
//! family of tables. Mirrors `SPEC_FULL.md` section 3/6 exactly; `payload`
//! everywhere is an opaque blob already produced by the serializer, never
//! interpreted by the store itself.

use chrono::{DateTime, Utc};
use commercebus_core::AggregateId;

/// An event not yet assigned a stream position, produced by a command
/// dispatcher after `Aggregate::handle` decides it.
#[derive(Debug, Clone)]
pub struct UncommittedEvent {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub correlation_id: Option<uuid::Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// An event as it exists in the store: immutable, uniquely identified by
/// `(aggregate_id, version)`.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: u64,
    pub event_type: String,
    pub correlation_id: Option<uuid::Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub correlation_id: Option<uuid::Uuid>,
    pub version: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Dispatched,
    Processed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "dispatched" => Some(OutboxStatus::Dispatched),
            "processed" => Some(OutboxStatus::Processed),
            _ => None,
        }
    }
}

/// An outbox row: created in the same local transaction that appends the
/// event it carries. `event` is the already-serialized payload that will be
/// published verbatim to the transport.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: uuid::Uuid,
    pub stream_name: String,
    pub event_type: String,
    pub event: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    InFlight,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::InFlight => "in-flight",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in-flight" => Some(ProcessingStatus::InFlight),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// Per-(outboxId, handlerId) retry lane, supporting fan-out: an outbox row
/// is only deleted once every handler's row for it is `Completed`.
#[derive(Debug, Clone)]
pub struct ProcessingRow {
    pub outbox_id: uuid::Uuid,
    pub handler_id: String,
    pub status: ProcessingStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Which terminal DLQ a message landed in: `Undeliverable` if it never made
/// it onto the transport (dispatcher/sweeper exhausted), `Unprocessable` if
/// it was delivered but a handler kept failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqKind {
    Undeliverable,
    Unprocessable,
}

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub outbox_id: uuid::Uuid,
    pub handler_id: Option<String>,
    pub kind: DlqKind,
    pub event: Vec<u8>,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}
