//! `EventBus`: the publish/subscribe seam between command dispatch and
//! projections/external-effect handlers.
//!
//! This trait is transport-agnostic; `commercebus-infra` provides a
//! Redis-streams-backed implementation, and `InMemoryEventBus` here is both
//! a test double and a legitimate single-process wiring choice.

use std::sync::mpsc;
use std::sync::Arc;

/// A subscriber's handle onto the bus: a receiving end of a channel.
///
/// Blocking, not async: the bus itself runs on whichever worker thread
/// publishes (the command dispatcher's thread, or the infra transport's
/// background consumer loop), so subscription consumption is expected to
/// happen on a dedicated thread too.
pub struct Subscription<M> {
    receiver: mpsc::Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until a message arrives, or the bus has no more publishers.
    pub fn recv(&self) -> Option<M> {
        self.receiver.recv().ok()
    }

    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// A place to publish messages of type `M` and subscribe to future ones.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;
    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
