//! `CommandHandler`: the decide-then-apply loop lifted out of
//! `Aggregate::handle`/`Aggregate::apply` so dispatchers don't repeat it.

use commercebus_core::Aggregate;

pub trait CommandHandler<A: Aggregate> {
    fn handle(&self, aggregate: &A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>;
}

/// Decide events for `command` against `aggregate`, then fold them into
/// `aggregate`'s in-memory state immediately (so the caller's in-memory copy
/// reflects the decision before it is persisted).
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = aggregate.handle(command)?;
    for event in &events {
        aggregate.apply(event);
    }
    Ok(events)
}
