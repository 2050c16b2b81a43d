//! Outbox Sweeper: periodic recovery for rows stuck `pending` past their
//! createdAt threshold or stuck `dispatched` past their dispatchedAt
//! threshold (likely lost in transit, or lost while a consumer was mid-ACK).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::config::SweeperConfig;
use crate::event_store::{LocalStore, OutboxEntry};
use crate::outbox::Publisher;

pub struct OutboxSweeper<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: SweeperConfig,
    running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<S: LocalStore + 'static, P: Publisher + 'static> OutboxSweeper<S, P> {
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: SweeperConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// A second call while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::channel();
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let this = Arc::clone(self);
        let handle = thread::spawn(move || {
            let interval = Duration::from_millis(this.config.sweep_interval_ms);
            loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        this.sweep_once();
                        this.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        this.sweep_once();
                    }
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Drains any in-flight sweep and stops the timer.
    pub fn shutdown(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn sweep_once(&self) {
        let now = Utc::now();
        let pending_cutoff = now - chrono::Duration::milliseconds(self.config.pending_threshold_ms);
        let dispatched_cutoff = now - chrono::Duration::milliseconds(self.config.dispatched_threshold_ms);

        let stuck = match self.store.stuck_pending(pending_cutoff) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "sweeper failed to scan stuck pending rows");
                Vec::new()
            }
        };
        let stuck_dispatched = match self.store.stuck_dispatched(dispatched_cutoff) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "sweeper failed to scan stuck dispatched rows");
                Vec::new()
            }
        };

        for row in stuck.into_iter().chain(stuck_dispatched) {
            // An error recovering one row must never stop the sweep for the
            // rest of this tick's rows.
            self.recover_row(row);
        }
    }

    fn recover_row(&self, row: OutboxEntry) {
        if row.attempts >= self.config.max_attempts {
            let last_error = format!("Max attempts exceeded ({})", row.attempts);
            if let Err(e) = self.store.move_to_undeliverable_dlq(&row, last_error) {
                error!(outbox_id = %row.id, error = %e, "failed to move row to undeliverable DLQ");
            } else {
                info!(outbox_id = %row.id, attempts = row.attempts, "moved outbox row to undeliverable DLQ");
            }
            return;
        }

        match self.publisher.publish(&row.stream_name, row.id, &row.event_type, &row.event) {
            Ok(()) => {
                if let Err(e) = self.store.mark_outbox_dispatched(row.id) {
                    error!(outbox_id = %row.id, error = %e, "failed to mark recovered row dispatched");
                }
            }
            Err(e) => {
                error!(outbox_id = %row.id, error = %e, "sweeper republish failed, will retry next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryLocalStore, Mutation, Submission};
    use crate::outbox::PublishError;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingPublisher {
        calls: StdMutex<u32>,
    }

    impl Publisher for CountingPublisher {
        fn publish(&self, _stream_name: &str, _outbox_id: Uuid, _event_type: &str, _payload: &[u8]) -> Result<(), PublishError> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn republishes_stuck_pending_rows_and_marks_dispatched() {
        let store = Arc::new(InMemoryLocalStore::default());
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

        let publisher = Arc::new(CountingPublisher::default());
        let mut config = SweeperConfig::default();
        config.pending_threshold_ms = -1; // every row looks stuck immediately
        let sweeper = Arc::new(OutboxSweeper::new(Arc::clone(&store), Arc::clone(&publisher), config));

        sweeper.sweep_once();

        assert_eq!(*publisher.calls.lock().unwrap(), 1);
        let row = store.get_outbox(id).unwrap().unwrap();
        assert_eq!(row.status, crate::event_store::OutboxStatus::Dispatched);
    }

    #[test]
    fn moves_exhausted_rows_to_dlq_without_publishing() {
        let store = Arc::new(InMemoryLocalStore::default());
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
        for _ in 0..10 {
            store.mark_outbox_dispatched(id).unwrap();
        }

        let publisher = Arc::new(CountingPublisher::default());
        let mut config = SweeperConfig::default();
        config.dispatched_threshold_ms = -1;
        config.max_attempts = 10;
        let sweeper = Arc::new(OutboxSweeper::new(Arc::clone(&store), Arc::clone(&publisher), config));

        sweeper.sweep_once();

        assert_eq!(*publisher.calls.lock().unwrap(), 0);
        assert!(store.get_outbox(id).unwrap().is_none());
    }

    #[test]
    fn start_is_idempotent_while_running() {
        let store = Arc::new(InMemoryLocalStore::default());
        let publisher = Arc::new(CountingPublisher::default());
        let sweeper = Arc::new(OutboxSweeper::new(store, publisher, SweeperConfig::default()));

        sweeper.start();
        sweeper.start();
        sweeper.shutdown();
    }
}
