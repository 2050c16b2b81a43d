//! Outbox Dispatcher: the first publish attempt for a freshly-appended
//! outbox row. Not transactional across stores by itself — the Sweeper
//! supplies the recovery guarantee if a row never gets a dispatcher turn
//! or the publish/status-update pair is interrupted mid-flight.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::event_store::{LocalStore, LocalStoreError, OutboxStatus};
use crate::outbox::{PublishError, Publisher};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] LocalStoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("outbox row {0} not found")]
    NotFound(Uuid),
    /// Not an error condition for the caller: the row had already moved
    /// past `pending` by the time this dispatch attempt ran.
    #[error("outbox row {0} is no longer pending")]
    AlreadyHandled(Uuid),
}

pub struct OutboxDispatcher<S, P> {
    store: Arc<S>,
    publisher: P,
}

impl<S: LocalStore, P: Publisher> OutboxDispatcher<S, P> {
    pub fn new(store: Arc<S>, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn dispatch(&self, outbox_id: Uuid) -> Result<(), DispatchError> {
        let row = self
            .store
            .get_outbox(outbox_id)?
            .ok_or(DispatchError::NotFound(outbox_id))?;

        if row.status != OutboxStatus::Pending {
            return Err(DispatchError::AlreadyHandled(outbox_id));
        }

        match self.publisher.publish(&row.stream_name, row.id, &row.event_type, &row.event) {
            Ok(()) => {
                self.store.mark_outbox_dispatched(outbox_id)?;
                info!(outbox_id = %outbox_id, stream = %row.stream_name, "dispatched outbox row");
                Ok(())
            }
            Err(e) => {
                warn!(outbox_id = %outbox_id, error = %e, "publish failed, row stays pending");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryLocalStore, Mutation, Submission};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePublisher {
        published: Mutex<Vec<(String, Uuid)>>,
        fail_next: Mutex<bool>,
    }

    impl Publisher for FakePublisher {
        fn publish(&self, stream_name: &str, outbox_id: Uuid, _event_type: &str, _payload: &[u8]) -> Result<(), PublishError> {
            if *self.fail_next.lock().unwrap() {
                return Err(PublishError("simulated transport failure".into()));
            }
            self.published.lock().unwrap().push((stream_name.to_string(), outbox_id));
            Ok(())
        }
    }

    fn seeded_outbox(store: &InMemoryLocalStore) -> Uuid {
        let id = Uuid::new_v4();
        store
            .apply_batch(&[Submission {
                mutations: vec![Mutation::AppendOutbox {
                    id,
                    stream_name: "events:order:2026-07-26".to_string(),
                    event_type: "OrderPlaced".to_string(),
                    event: b"{}".to_vec(),
                }],
            }])
            .remove(0)
            .unwrap();
        id
    }

    #[test]
    fn dispatches_pending_row_and_marks_it_dispatched() {
        let store = Arc::new(InMemoryLocalStore::default());
        let id = seeded_outbox(&store);
        let dispatcher = OutboxDispatcher::new(Arc::clone(&store), FakePublisher::default());

        dispatcher.dispatch(id).unwrap();

        let row = store.get_outbox(id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Dispatched);
        assert_eq!(row.attempts, 1);
    }

    #[test]
    fn leaves_row_pending_on_publish_failure() {
        let store = Arc::new(InMemoryLocalStore::default());
        let id = seeded_outbox(&store);
        let publisher = FakePublisher::default();
        *publisher.fail_next.lock().unwrap() = true;
        let dispatcher = OutboxDispatcher::new(Arc::clone(&store), publisher);

        assert!(dispatcher.dispatch(id).is_err());

        let row = store.get_outbox(id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);
    }

    #[test]
    fn skips_a_row_that_already_moved_past_pending() {
        let store = Arc::new(InMemoryLocalStore::default());
        let id = seeded_outbox(&store);
        store.mark_outbox_dispatched(id).unwrap();
        let dispatcher = OutboxDispatcher::new(Arc::clone(&store), FakePublisher::default());

        assert!(matches!(dispatcher.dispatch(id), Err(DispatchError::AlreadyHandled(_))));
    }
}
