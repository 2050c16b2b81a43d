//! Outbox Poller: the alternative local-only pipeline for deployments with
//! no Redis transport. Polls the outbox directly, fans each row out to every
//! handler registered for its event type via a `ProcessingRow` per
//! `(outboxId, handlerId)`, and batches acknowledgement writes on their own
//! flush interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{retry_backoff, PollerConfig};
use crate::error::HandlerError;
use crate::event_store::{LocalStore, OutboxEntry, ProcessingRow, ProcessingStatus};
use crate::outbox::HandlerRegistry;

/// One handler's verdict after running against a polled row, queued for the
/// batched ack flush rather than written synchronously.
enum AckWrite {
    Completed { outbox_id: Uuid, handler_id: String },
    Retry { outbox_id: Uuid, handler_id: String, retry_count: u32 },
    Dlq { outbox_id: Uuid, handler_id: String, event: Vec<u8>, attempts: u32, error: String },
}

pub struct OutboxPoller<S> {
    store: Arc<S>,
    handlers: HandlerRegistry,
    config: PollerConfig,
    running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<S: LocalStore + 'static> OutboxPoller<S> {
    pub fn new(store: Arc<S>, handlers: HandlerRegistry, config: PollerConfig) -> Self {
        Self {
            store,
            handlers,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::channel();
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let this = Arc::clone(self);
        let handle = thread::spawn(move || {
            let poll_interval = Duration::from_millis(this.config.poll_interval_ms);
            let ack_interval = Duration::from_millis(this.config.ack_flush_interval_ms);
            let mut ack_buffer: Vec<AckWrite> = Vec::new();
            let mut last_ack_flush = Instant::now();

            loop {
                match stop_rx.recv_timeout(poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        this.poll_once(&mut ack_buffer);
                        this.flush_acks(&mut ack_buffer);
                        this.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        this.poll_once(&mut ack_buffer);
                        if ack_buffer.len() >= this.config.ack_flush_size_threshold
                            || last_ack_flush.elapsed() >= ack_interval
                        {
                            this.flush_acks(&mut ack_buffer);
                            last_ack_flush = Instant::now();
                        }
                    }
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn shutdown(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn poll_once(&self, ack_buffer: &mut Vec<AckWrite>) {
        let now = Utc::now();
        let rows = match self.store.poller_ready(now) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "poller failed to read ready rows");
                return;
            }
        };
        for row in rows {
            self.process_row(&row, ack_buffer);
        }
    }

    fn process_row(&self, row: &OutboxEntry, ack_buffer: &mut Vec<AckWrite>) {
        let handlers = self.handlers.handlers_for(&row.event_type);
        for handler in handlers {
            let handler_id = handler.handler_id().to_string();
            let existing = self.store.get_processing_row(row.id, &handler_id).ok().flatten();
            if matches!(existing, Some(ref r) if r.status == ProcessingStatus::Completed) {
                continue;
            }

            match handler.handle(&row.event_type, &row.event) {
                Ok(()) => ack_buffer.push(AckWrite::Completed { outbox_id: row.id, handler_id }),
                Err(HandlerError::Permanent(msg)) => ack_buffer.push(AckWrite::Dlq {
                    outbox_id: row.id,
                    handler_id,
                    event: row.event.clone(),
                    attempts: existing.map(|r| r.retry_count).unwrap_or(0) + 1,
                    error: msg,
                }),
                Err(HandlerError::Transient(msg)) => {
                    let retry_count = existing.map(|r| r.retry_count).unwrap_or(0) + 1;
                    if retry_count > self.config.max_retries {
                        ack_buffer.push(AckWrite::Dlq {
                            outbox_id: row.id,
                            handler_id,
                            event: row.event.clone(),
                            attempts: retry_count,
                            error: msg,
                        });
                    } else {
                        ack_buffer.push(AckWrite::Retry { outbox_id: row.id, handler_id, retry_count });
                    }
                }
            }
        }
    }

    fn flush_acks(&self, ack_buffer: &mut Vec<AckWrite>) {
        if ack_buffer.is_empty() {
            return;
        }
        let writes = std::mem::take(ack_buffer);
        let mut touched_outboxes = std::collections::HashSet::new();

        for write in writes {
            match write {
                AckWrite::Completed { outbox_id, handler_id } => {
                    touched_outboxes.insert(outbox_id);
                    if let Err(e) = self.store.upsert_processing_row(ProcessingRow {
                        outbox_id,
                        handler_id,
                        status: ProcessingStatus::Completed,
                        retry_count: 0,
                        next_retry_at: None,
                    }) {
                        error!(outbox_id = %outbox_id, error = %e, "failed to record handler completion");
                    }
                }
                AckWrite::Retry { outbox_id, handler_id, retry_count } => {
                    let next_retry_at = Utc::now()
                        + chrono::Duration::from_std(retry_backoff(
                            self.config.retry_backoff_base,
                            self.config.retry_backoff_unit_ms,
                            retry_count,
                        ))
                        .unwrap_or_default();
                    if let Err(e) = self.store.upsert_processing_row(ProcessingRow {
                        outbox_id,
                        handler_id,
                        status: ProcessingStatus::Failed,
                        retry_count,
                        next_retry_at: Some(next_retry_at),
                    }) {
                        error!(outbox_id = %outbox_id, error = %e, "failed to record handler retry");
                    }
                }
                AckWrite::Dlq { outbox_id, handler_id, event, attempts, error: last_error } => {
                    if let Err(e) =
                        self.store.move_to_unprocessable_dlq(outbox_id, handler_id, event, attempts, last_error)
                    {
                        error!(outbox_id = %outbox_id, error = %e, "failed to move row to unprocessable DLQ");
                    }
                }
            }
        }

        for outbox_id in touched_outboxes {
            self.delete_if_all_handlers_completed(outbox_id);
        }
    }

    fn delete_if_all_handlers_completed(&self, outbox_id: Uuid) {
        let rows = match self.store.processing_rows_for_outbox(outbox_id) {
            Ok(rows) => rows,
            Err(e) => {
                error!(outbox_id = %outbox_id, error = %e, "failed to read processing rows");
                return;
            }
        };
        if !rows.is_empty() && rows.iter().all(|r| r.status == ProcessingStatus::Completed) {
            if let Err(e) = self.store.delete_outbox(outbox_id) {
                error!(outbox_id = %outbox_id, error = %e, "failed to delete completed outbox row");
            } else {
                info!(outbox_id = %outbox_id, "all handlers completed, outbox row removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryLocalStore;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    struct CountingHandler {
        id: &'static str,
        fail_times: u32,
        calls: AtomicU32,
    }

    impl crate::outbox::EffectHandler for CountingHandler {
        fn handler_id(&self) -> &str {
            self.id
        }

        fn handle(&self, _event_type: &str, _payload: &[u8]) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if call < self.fail_times {
                Err(HandlerError::Transient("not yet".into()))
            } else {
                Ok(())
            }
        }
    }

    fn seeded_row(store: &InMemoryLocalStore) -> Uuid {
        use crate::event_store::{Mutation, Submission};
        let id = Uuid::new_v4();
        store
            .apply_batch(&[Submission {
                mutations: vec![Mutation::AppendOutbox {
                    id,
                    stream_name: "local".to_string(),
                    event_type: "OrderPlaced".to_string(),
                    event: b"{}".to_vec(),
                }],
            }])
            .remove(0)
            .unwrap();
        id
    }

    #[test]
    fn completed_handler_deletes_the_outbox_row() {
        let store = Arc::new(InMemoryLocalStore::default());
        let id = seeded_row(&store);

        let mut registry = HandlerRegistry::default();
        registry.register(
            "OrderPlaced",
            Arc::new(CountingHandler { id: "billing", fail_times: 0, calls: AtomicU32::new(0) }),
        );

        let poller = OutboxPoller::new(Arc::clone(&store), registry, PollerConfig::default());
        let mut ack_buffer = Vec::new();
        poller.poll_once(&mut ack_buffer);
        poller.flush_acks(&mut ack_buffer);

        assert!(store.get_outbox(id).unwrap().is_none());
    }

    #[test]
    fn transient_failure_schedules_a_retry_without_deleting_row() {
        let store = Arc::new(InMemoryLocalStore::default());
        let id = seeded_row(&store);

        let mut registry = HandlerRegistry::default();
        registry.register(
            "OrderPlaced",
            Arc::new(CountingHandler { id: "billing", fail_times: 5, calls: AtomicU32::new(0) }),
        );

        let poller = OutboxPoller::new(Arc::clone(&store), registry, PollerConfig::default());
        let mut ack_buffer = Vec::new();
        poller.poll_once(&mut ack_buffer);
        poller.flush_acks(&mut ack_buffer);

        assert!(store.get_outbox(id).unwrap().is_some());
        let row = store.get_processing_row(id, "billing").unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Failed);
        assert_eq!(row.retry_count, 1);
    }

    #[test]
    fn exhausted_retries_move_row_to_unprocessable_dlq() {
        let store = Arc::new(InMemoryLocalStore::default());
        let id = seeded_row(&store);

        let mut registry = HandlerRegistry::default();
        registry.register(
            "OrderPlaced",
            Arc::new(CountingHandler { id: "billing", fail_times: 100, calls: AtomicU32::new(0) }),
        );

        let mut config = PollerConfig::default();
        config.max_retries = 0;
        let poller = OutboxPoller::new(Arc::clone(&store), registry, config);
        let mut ack_buffer = Vec::new();
        poller.poll_once(&mut ack_buffer);
        poller.flush_acks(&mut ack_buffer);

        assert!(store.get_processing_row(id, "billing").unwrap().is_none());
    }
}
