//! The `Event` trait: an immutable fact about something that has already
//! happened to an aggregate.
//!
//! Events are the atoms of this system. Once appended they are never
//! mutated or deleted (aside from moving to a DLQ, which preserves rather
//! than discards them). Every downstream reader — snapshots, projections,
//! external effects — is a pure function of the event stream.

use chrono::{DateTime, Utc};
use core::fmt::Debug;

/// An event type that can be appended to an aggregate's stream.
///
/// `event_type` is the stable, serialization-facing name (the `eventName`
/// in the data model) used for routing handlers and for the serializer's
/// type registry; it must never change once events of that type have been
/// persisted. `version` is the event *schema* version (not the aggregate's
/// stream version) — bump it when the payload shape changes in a
/// backward-incompatible way.
pub trait Event: Clone + Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;
    fn version(&self) -> u32;
    fn occurred_at(&self) -> DateTime<Utc>;
}
