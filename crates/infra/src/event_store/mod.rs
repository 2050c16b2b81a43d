//! The Local Event Store: event log, snapshots, and the outbox family of
//! tables, behind one `LocalStore` trait shared by every backend.

pub mod model;
pub mod store_api;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod in_memory;

pub use in_memory::InMemoryLocalStore;
pub use model::{
    AggregateSnapshot, DlqEntry, DlqKind, OutboxEntry, OutboxStatus, ProcessingRow,
    ProcessingStatus, StoredEvent, UncommittedEvent,
};
pub use store_api::{LocalStore, LocalStoreError, Mutation, MutationResult, Submission, SubmissionOutcome};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLocalStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLocalStore;
