//! `EventEnvelope`: an event plus the stream coordinates it was appended at.

use commercebus_core::AggregateId;

/// An event together with its position in an aggregate's stream.
///
/// This is the shape that crosses the event-bus/transport boundary: bus
/// subscribers and projections only ever see envelopes, never bare events,
/// so they always know which aggregate and which version produced them.
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    event_id: uuid::Uuid,
    aggregate_id: AggregateId,
    aggregate_type: String,
    sequence_number: u64,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: uuid::Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> uuid::Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
