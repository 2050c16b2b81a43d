//! Infrastructure crate: the Local Event Store, Transaction Batcher, Unit of
//! Work, transactional outbox, Redis transport, and consumer-side
//! coordination that sit underneath the domain aggregates. Aggregates
//! themselves are an external collaborator; this crate only moves their
//! events and commands around durably.

pub mod config;
pub mod error;
pub mod event_store;
pub mod serializer;

pub mod batcher;
pub mod unit_of_work;

pub mod outbox;

#[cfg(feature = "redis-transport")]
pub mod transport;

pub mod coordinator;
pub mod consumer;

pub use batcher::TransactionBatcher;
pub use config::{
    BatcherConfig, Bootstrap, ConsumerConfig, CoordinatorConfig, PollerConfig, SerializerConfig,
    SweeperConfig,
};
pub use error::HandlerError;
pub use unit_of_work::UnitOfWork;
