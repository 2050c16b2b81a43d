//! Aggregate root trait for event-sourced domain models, and the optimistic
//! concurrency marker (`ExpectedVersion`) the event store and Lua command
//! transaction both enforce.

/// Aggregate root marker + minimal interface.
///
/// Intentionally small so domain collaborators can decide how they model
/// state transitions without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// For event-sourced aggregates this corresponds to the number of events
    /// applied (the stream revision).
    fn version(&self) -> u64;
}

/// The decide/apply seam a command dispatcher drives an aggregate through.
///
/// `handle` is the deciding function: given the current state and a command,
/// it either rejects the command (`Err`) or returns the events that should be
/// appended. It must be pure — no I/O, no side effects. `apply` folds a single
/// event into the aggregate's state and must never fail; events are facts,
/// already-accepted history.
pub trait Aggregate: Default + Send + Sync {
    type Command;
    type Event: Clone;
    type Error;

    /// Decide what, if anything, should happen in response to `command`.
    ///
    /// Returning `Ok(vec![])` means "no-op" (nothing to append); this is
    /// distinct from `Err`, which means the command is rejected.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Fold `event` into the aggregate's in-memory state.
    fn apply(&mut self, event: &Self::Event);
}

/// Optimistic concurrency precondition for an append.
///
/// Mirrors the Lua command transaction's version check: `Exact(v)` requires
/// the stream to currently be at version `v` (i.e. `v` events already
/// appended); `Any` skips the check entirely (used for idempotent replay
/// paths and saga compensations where ordering is established elsewhere).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    Exact(u64),
}

impl ExpectedVersion {
    /// Does `current` (the stream's version before this append) satisfy
    /// this precondition?
    pub fn matches(&self, current: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(expected) => *expected == current,
        }
    }
}
