//! The `Command` trait: an intent to change one aggregate's state.

use commercebus_core::AggregateId;

/// A command targets exactly one aggregate; dispatch loads that aggregate's
/// stream before deciding anything.
pub trait Command {
    fn target_aggregate_id(&self) -> AggregateId;
}
