//! Value object marker: types compared by value, with no identity of their own.

/// Marker trait for value objects (types with domain meaning and invariants,
/// but no identity).
pub trait ValueObject: Clone + PartialEq {}
