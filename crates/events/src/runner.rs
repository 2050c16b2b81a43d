//! `ProjectionRunner`: drives envelopes into a `Projection`, enforcing that
//! each aggregate's events are applied in strictly increasing sequence order.
//!
//! This is the in-process folding discipline shared by every projection,
//! regardless of whether its events arrive via the in-memory bus (tests) or
//! via the Redis stream consumer (`commercebus-infra`).

use std::collections::HashMap;

use commercebus_core::AggregateId;
use thiserror::Error;

use crate::envelope::EventEnvelope;
use crate::event::Event;
use crate::projection::Projection;

/// Per-aggregate replay position for a single projection.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionCursor {
    pub aggregate_id: AggregateId,
    pub last_sequence_number: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error(
        "non-monotonic sequence for aggregate {aggregate_id}: last={last}, got={got}"
    )]
    NonMonotonicSequence {
        aggregate_id: AggregateId,
        last: u64,
        got: u64,
    },
}

/// Wraps a `Projection` with a per-aggregate cursor table, so callers can
/// feed it envelopes from any source without re-deriving the ordering check
/// themselves.
pub struct ProjectionRunner<P: Projection> {
    projection: P,
    cursors: HashMap<AggregateId, u64>,
}

impl<P: Projection> ProjectionRunner<P> {
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursors: HashMap::new(),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn cursor(&self, aggregate_id: AggregateId) -> Option<ProjectionCursor> {
        self.cursors
            .get(&aggregate_id)
            .map(|&last_sequence_number| ProjectionCursor {
                aggregate_id,
                last_sequence_number,
            })
    }

    /// Apply a single envelope, enforcing strictly increasing
    /// `sequence_number` per `aggregate_id`.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<(), ProjectionError>
    where
        P::Ev: Event,
    {
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        let last = self.cursors.get(&aggregate_id).copied().unwrap_or(0);

        if seq <= last {
            return Err(ProjectionError::NonMonotonicSequence {
                aggregate_id,
                last,
                got: seq,
            });
        }

        self.projection.apply(envelope);
        self.cursors.insert(aggregate_id, seq);
        Ok(())
    }

    /// Apply a batch of envelopes in order, short-circuiting on the first
    /// ordering violation.
    pub fn run(&mut self, envelopes: &[EventEnvelope<P::Ev>]) -> Result<(), ProjectionError>
    where
        P::Ev: Event,
    {
        for envelope in envelopes {
            self.apply(envelope)?;
        }
        Ok(())
    }

    /// Discard all cursor state and the projection's own state, replacing the
    /// projection with `fresh`, then replay `history` from scratch. Used by
    /// the DLQ-reprocess and projection-rebuild paths.
    pub fn rebuild_from_scratch(
        &mut self,
        fresh: P,
        history: &[EventEnvelope<P::Ev>],
    ) -> Result<(), ProjectionError>
    where
        P::Ev: Event,
    {
        self.projection = fresh;
        self.cursors.clear();
        self.run(history)
    }
}
