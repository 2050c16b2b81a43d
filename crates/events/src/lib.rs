//! Pure event-sourcing mechanics: the `Event`/`Command` vocabulary, an
//! envelope carrying an event alongside its stream position, an in-process
//! event bus used by tests and single-process wiring, and a projection
//! runner enforcing monotonic sequencing.
//!
//! No storage, no transport — those live in `commercebus-infra`.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::{execute, CommandHandler};
pub use in_memory_bus::InMemoryEventBus;
pub use projection::Projection;
pub use runner::{ProjectionCursor, ProjectionError, ProjectionRunner};
