//! The transactional outbox family: dispatcher (first publish attempt),
//! sweeper (time-based recovery), and the local-only poller variant that
//! replaces the Redis consumer entirely when a deployment has no transport.

pub mod dispatcher;
pub mod poller;
pub mod sweeper;

pub use dispatcher::OutboxDispatcher;
pub use poller::OutboxPoller;
pub use sweeper::OutboxSweeper;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::error::HandlerError;

/// What the dispatcher and sweeper publish through. The real implementation
/// lives in the Redis transport; tests use an in-memory fake.
pub trait Publisher: Send + Sync {
    fn publish(&self, stream_name: &str, outbox_id: uuid::Uuid, event_type: &str, payload: &[u8]) -> Result<(), PublishError>;
}

#[derive(Debug, Error, Clone)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(&self, stream_name: &str, outbox_id: uuid::Uuid, event_type: &str, payload: &[u8]) -> Result<(), PublishError> {
        (**self).publish(stream_name, outbox_id, event_type, payload)
    }
}

/// An external collaborator's projection/effect handler, addressed by a
/// stable id so its `ProcessingRow` survives process restarts.
pub trait EffectHandler: Send + Sync {
    fn handler_id(&self) -> &str;
    fn handle(&self, event_type: &str, payload: &[u8]) -> Result<(), HandlerError>;
}

/// `eventType -> handlers` fan-out table consulted by the poller (and, once
/// wired up, the stream consumer).
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EffectHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EffectHandler>) {
        self.handlers.entry(event_type.into()).or_default().push(handler);
    }

    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn EffectHandler>] {
        self.handlers.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }
}
