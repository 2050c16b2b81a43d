//! Cross-cutting error vocabulary: how a domain-collaborator handler
//! communicates retryability, and the split between transient and permanent
//! infrastructure failures that the sweeper/consumer/poller all key off of.

use thiserror::Error;

/// What an external collaborator's projection/effect handler returns.
///
/// The consumer and poller both branch on this rather than string-sniffing
/// an error message: `Transient` stays in the retry lane (PEL / ProcessingRow
/// retry), `Permanent` routes straight to a DLQ regardless of remaining
/// retry budget.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("transient handler failure: {0}")]
    Transient(String),
    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}
