//! In-memory `LocalStore`: no filesystem I/O, used to exercise everything
//! layered above the store (batcher, outbox pipeline, dispatcher, sweeper,
//! poller) deterministically in tests. Mirrors the teacher's
//! `InMemoryEventStore` (`RwLock<HashMap<..>>`) shape.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use commercebus_core::AggregateId;
use uuid::Uuid;

use super::model::{
    AggregateSnapshot, DlqEntry, DlqKind, OutboxEntry, OutboxStatus, ProcessingRow, StoredEvent,
};
use super::store_api::{LocalStore, LocalStoreError, Mutation, MutationResult, Submission, SubmissionOutcome};

#[derive(Default, Clone)]
struct State {
    events: HashMap<AggregateId, Vec<StoredEvent>>,
    snapshots: HashMap<AggregateId, AggregateSnapshot>,
    outbox: HashMap<Uuid, OutboxEntry>,
    processing: HashMap<(Uuid, String), ProcessingRow>,
    dlq: Vec<DlqEntry>,
}

pub struct InMemoryLocalStore {
    state: RwLock<State>,
}

impl Default for InMemoryLocalStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dlq_entries(&self) -> Vec<DlqEntry> {
        self.state.read().unwrap().dlq.clone()
    }
}

fn apply_mutation(state: &mut State, mutation: &Mutation) -> Result<MutationResult, LocalStoreError> {
    match mutation {
        Mutation::AppendEvent { event, expected_version } => {
            let stream = state.events.entry(event.aggregate_id).or_default();
            let current = stream.len() as u64;
            if !expected_version.matches(current) {
                return Err(LocalStoreError::VersionConflict {
                    aggregate_id: event.aggregate_id,
                    expected: match expected_version {
                        commercebus_core::ExpectedVersion::Exact(v) => *v,
                        commercebus_core::ExpectedVersion::Any => current,
                    },
                    actual: current,
                });
            }
            let stored = StoredEvent {
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type.clone(),
                version: current + 1,
                event_type: event.event_type.clone(),
                correlation_id: event.correlation_id,
                occurred_at: event.occurred_at,
                payload: event.payload.clone(),
            };
            stream.push(stored.clone());
            Ok(MutationResult::EventAppended(stored))
        }
        Mutation::SaveSnapshot(snapshot) => {
            if let Some(existing) = state.snapshots.get(&snapshot.aggregate_id) {
                if snapshot.version < existing.version {
                    return Err(LocalStoreError::InvalidAppend(format!(
                        "snapshot version {} is behind stored version {}",
                        snapshot.version, existing.version
                    )));
                }
            }
            state.snapshots.insert(snapshot.aggregate_id, snapshot.clone());
            Ok(MutationResult::SnapshotSaved)
        }
        Mutation::AppendOutbox { id, stream_name, event_type, event } => {
            if state.outbox.contains_key(id) {
                return Err(LocalStoreError::InvalidAppend(format!(
                    "outbox id {id} already exists"
                )));
            }
            let entry = OutboxEntry {
                id: *id,
                stream_name: stream_name.clone(),
                event_type: event_type.clone(),
                event: event.clone(),
                status: OutboxStatus::Pending,
                attempts: 0,
                created_at: Utc::now(),
                dispatched_at: None,
                processed_at: None,
            };
            state.outbox.insert(*id, entry.clone());
            Ok(MutationResult::OutboxAppended(entry))
        }
    }
}

impl LocalStore for InMemoryLocalStore {
    fn apply_batch(&self, submissions: &[Submission]) -> Vec<SubmissionOutcome> {
        let mut state = self.state.write().unwrap();
        let mut outcomes = Vec::with_capacity(submissions.len());

        for submission in submissions {
            let checkpoint = state.clone();
            let mut results = Vec::with_capacity(submission.mutations.len());
            let mut failure = None;

            for mutation in &submission.mutations {
                match apply_mutation(&mut state, mutation) {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            match failure {
                Some(e) => {
                    *state = checkpoint;
                    outcomes.push(Err(e));
                }
                None => outcomes.push(Ok(results)),
            }
        }

        outcomes
    }

    fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<AggregateSnapshot>, LocalStoreError> {
        Ok(self.state.read().unwrap().snapshots.get(&aggregate_id).cloned())
    }

    fn events_after(
        &self,
        aggregate_id: AggregateId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, LocalStoreError> {
        Ok(self
            .state
            .read()
            .unwrap()
            .events
            .get(&aggregate_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_outbox(&self, id: Uuid) -> Result<Option<OutboxEntry>, LocalStoreError> {
        Ok(self.state.read().unwrap().outbox.get(&id).cloned())
    }

    fn mark_outbox_dispatched(&self, id: Uuid) -> Result<(), LocalStoreError> {
        let mut state = self.state.write().unwrap();
        let entry = state.outbox.get_mut(&id).ok_or(LocalStoreError::NotFound)?;
        entry.status = OutboxStatus::Dispatched;
        entry.dispatched_at = Some(Utc::now());
        entry.attempts += 1;
        Ok(())
    }

    fn mark_outbox_processed(&self, id: Uuid) -> Result<(), LocalStoreError> {
        let mut state = self.state.write().unwrap();
        let entry = state.outbox.get_mut(&id).ok_or(LocalStoreError::NotFound)?;
        entry.status = OutboxStatus::Processed;
        entry.processed_at = Some(Utc::now());
        Ok(())
    }

    fn delete_outbox(&self, id: Uuid) -> Result<(), LocalStoreError> {
        self.state.write().unwrap().outbox.remove(&id);
        Ok(())
    }

    fn stuck_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        Ok(self
            .state
            .read()
            .unwrap()
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending && e.created_at < older_than)
            .cloned()
            .collect())
    }

    fn stuck_dispatched(&self, older_than: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        Ok(self
            .state
            .read()
            .unwrap()
            .outbox
            .values()
            .filter(|e| {
                e.status == OutboxStatus::Dispatched
                    && e.dispatched_at.map(|t| t < older_than).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    fn poller_ready(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>, LocalStoreError> {
        // `status = pending OR (status = failed AND nextRetryAt <= now)`.
        // The outbox table itself only tracks pending/dispatched/processed;
        // "failed" with a nextRetryAt lives on the per-handler ProcessingRow,
        // so here we surface pending rows plus any row with at least one
        // processing row whose retry is due.
        let state = self.state.read().unwrap();
        let mut ready: Vec<OutboxEntry> = state
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect();

        for row in state.processing.values() {
            if row.status == ProcessingStatusAlias::Failed
                && row.next_retry_at.map(|t| t <= now).unwrap_or(false)
            {
                if let Some(entry) = state.outbox.get(&row.outbox_id) {
                    if !ready.iter().any(|e| e.id == entry.id) {
                        ready.push(entry.clone());
                    }
                }
            }
        }
        Ok(ready)
    }

    fn move_to_undeliverable_dlq(&self, entry: &OutboxEntry, last_error: String) -> Result<(), LocalStoreError> {
        let mut state = self.state.write().unwrap();
        state.dlq.push(DlqEntry {
            outbox_id: entry.id,
            handler_id: None,
            kind: DlqKind::Undeliverable,
            event: entry.event.clone(),
            attempts: entry.attempts,
            last_error,
            created_at: Utc::now(),
        });
        state.outbox.remove(&entry.id);
        Ok(())
    }

    fn get_processing_row(
        &self,
        outbox_id: Uuid,
        handler_id: &str,
    ) -> Result<Option<ProcessingRow>, LocalStoreError> {
        Ok(self
            .state
            .read()
            .unwrap()
            .processing
            .get(&(outbox_id, handler_id.to_string()))
            .cloned())
    }

    fn upsert_processing_row(&self, row: ProcessingRow) -> Result<(), LocalStoreError> {
        self.state
            .write()
            .unwrap()
            .processing
            .insert((row.outbox_id, row.handler_id.clone()), row);
        Ok(())
    }

    fn processing_rows_for_outbox(&self, outbox_id: Uuid) -> Result<Vec<ProcessingRow>, LocalStoreError> {
        Ok(self
            .state
            .read()
            .unwrap()
            .processing
            .values()
            .filter(|r| r.outbox_id == outbox_id)
            .cloned()
            .collect())
    }

    fn move_to_unprocessable_dlq(
        &self,
        outbox_id: Uuid,
        handler_id: String,
        event: Vec<u8>,
        attempts: u32,
        last_error: String,
    ) -> Result<(), LocalStoreError> {
        let mut state = self.state.write().unwrap();
        state.dlq.push(DlqEntry {
            outbox_id,
            handler_id: Some(handler_id.clone()),
            kind: DlqKind::Unprocessable,
            event,
            attempts,
            last_error,
            created_at: Utc::now(),
        });
        state.processing.remove(&(outbox_id, handler_id));
        Ok(())
    }
}

use super::model::ProcessingStatus as ProcessingStatusAlias;

#[cfg(test)]
mod tests {
    use super::*;
    use commercebus_core::ExpectedVersion;

    fn uncommitted(aggregate_id: AggregateId) -> super::super::model::UncommittedEvent {
        super::super::model::UncommittedEvent {
            aggregate_id,
            aggregate_type: "Product".into(),
            event_type: "ProductCreated".into(),
            correlation_id: None,
            occurred_at: Utc::now(),
            payload: b"payload".to_vec(),
        }
    }

    #[test]
    fn appends_first_event_at_version_one() {
        let store = InMemoryLocalStore::new();
        let aggregate_id = AggregateId::new();
        let submission = Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(aggregate_id),
                expected_version: ExpectedVersion::Exact(0),
            }],
        };
        let outcomes = store.apply_batch(&[submission]);
        let results = outcomes.into_iter().next().unwrap().unwrap();
        match &results[0] {
            MutationResult::EventAppended(e) => assert_eq!(e.version, 1),
            _ => panic!("expected EventAppended"),
        }
    }

    #[test]
    fn version_conflict_isolated_to_losing_submission() {
        let store = InMemoryLocalStore::new();
        let aggregate_id = AggregateId::new();

        // Seed version 1.
        store.apply_batch(&[Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(aggregate_id),
                expected_version: ExpectedVersion::Exact(0),
            }],
        }]);

        // Two submissions both expecting version 1 (stale for the loser).
        let winner = Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(aggregate_id),
                expected_version: ExpectedVersion::Exact(1),
            }],
        };
        let loser = Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(aggregate_id),
                expected_version: ExpectedVersion::Exact(1),
            }],
        };

        let outcomes = store.apply_batch(&[winner, loser]);
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(LocalStoreError::VersionConflict { .. })));

        let events = store.events_after(aggregate_id, 0).unwrap();
        assert_eq!(events.len(), 2, "only the winner's event should be appended");
    }

    #[test]
    fn failed_submission_does_not_roll_back_earlier_ones_in_the_same_batch() {
        let store = InMemoryLocalStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        let ok_submission = Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(a),
                expected_version: ExpectedVersion::Exact(0),
            }],
        };
        let bad_submission = Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(b),
                expected_version: ExpectedVersion::Exact(5),
            }],
        };

        let outcomes = store.apply_batch(&[ok_submission, bad_submission]);
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert_eq!(store.events_after(a, 0).unwrap().len(), 1);
        assert_eq!(store.events_after(b, 0).unwrap().len(), 0);
    }

    #[test]
    fn snapshot_must_not_regress_version() {
        let store = InMemoryLocalStore::new();
        let aggregate_id = AggregateId::new();
        let snap = |version| super::super::model::AggregateSnapshot {
            aggregate_id,
            aggregate_type: "Product".into(),
            correlation_id: None,
            version,
            payload: vec![],
        };
        store.apply_batch(&[Submission {
            mutations: vec![Mutation::SaveSnapshot(snap(5))],
        }]);
        let outcomes = store.apply_batch(&[Submission {
            mutations: vec![Mutation::SaveSnapshot(snap(3))],
        }]);
        assert!(outcomes[0].is_err());
        assert_eq!(store.load_snapshot(aggregate_id).unwrap().unwrap().version, 5);
    }

    #[test]
    fn move_to_undeliverable_dlq_removes_outbox_row() {
        let store = InMemoryLocalStore::new();
        let id = Uuid::now_v7();
        store.apply_batch(&[Submission {
            mutations: vec![Mutation::AppendOutbox {
                id,
                stream_name: "events:Product".into(),
                event_type: "ProductCreated".into(),
                event: b"x".to_vec(),
            }],
        }]);
        let entry = store.get_outbox(id).unwrap().unwrap();
        store.move_to_undeliverable_dlq(&entry, "boom".into()).unwrap();
        assert!(store.get_outbox(id).unwrap().is_none());
        assert_eq!(store.dlq_entries().len(), 1);
    }
}
