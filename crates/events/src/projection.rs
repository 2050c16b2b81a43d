//! The `Projection` trait: a derived read model maintained by folding events.

use crate::envelope::EventEnvelope;
use crate::event::Event;

pub trait Projection {
    type Ev: Event;

    /// Fold one event into the projection's state. Implementations must be
    /// idempotent-adjacent: `ProjectionRunner` guarantees each envelope is
    /// applied at most once, in order, but a rebuild from scratch re-applies
    /// the whole history, so `apply` should not assume "first time seeing
    /// this aggregate" beyond what the envelope itself states.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
