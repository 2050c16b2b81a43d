//! Thin convenience wrapper over the Transaction Batcher: a caller builds its
//! mutations, hands them to `with_transaction`, and gets back exactly the
//! outcome the batcher's backing store produced for that submission alone.

use crate::batcher::{SubmitError, TransactionBatcher};
use crate::event_store::{LocalStoreError, Mutation, MutationResult, Submission};

#[derive(Debug, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Store(#[from] LocalStoreError),
}

pub struct UnitOfWork<'a> {
    batcher: &'a TransactionBatcher,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(batcher: &'a TransactionBatcher) -> Self {
        Self { batcher }
    }

    /// `f` decides which mutations this unit of work needs; this call
    /// blocks until they have been applied (or rejected) together, isolated
    /// from whatever else landed in the same flush.
    pub fn with_transaction<F>(&self, f: F) -> Result<Vec<MutationResult>, UnitOfWorkError>
    where
        F: FnOnce() -> Vec<Mutation>,
    {
        let mutations = f();
        let outcome = self.batcher.submit(Submission { mutations })?;
        Ok(outcome?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatcherConfig;
    use crate::event_store::{InMemoryLocalStore, UncommittedEvent};
    use commercebus_core::{AggregateId, ExpectedVersion};
    use std::sync::Arc;

    #[test]
    fn runs_a_single_mutation_transaction() {
        let store = Arc::new(InMemoryLocalStore::default());
        let batcher = TransactionBatcher::new(store, BatcherConfig::default());
        let uow = UnitOfWork::new(&batcher);

        let aggregate_id = AggregateId::new();
        let result = uow.with_transaction(|| {
            vec![Mutation::AppendEvent {
                event: UncommittedEvent {
                    aggregate_id,
                    aggregate_type: "order".to_string(),
                    event_type: "OrderPlaced".to_string(),
                    correlation_id: None,
                    occurred_at: chrono::Utc::now(),
                    payload: b"{}".to_vec(),
                },
                expected_version: ExpectedVersion::Exact(0),
            }]
        });

        assert!(result.is_ok());
        assert_eq!(result.unwrap().len(), 1);
    }
}
