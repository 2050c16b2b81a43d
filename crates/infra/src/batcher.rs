//! Transaction Batcher: coalesces concurrent commit requests into one local
//! transaction per flush tick, submitted to `LocalStore::apply_batch` so each
//! caller's mutations stay isolated from every other caller's in the same
//! flush via the backend's savepoint mechanism.
//!
//! A single background thread owns the store handle; callers hand in a
//! `Submission` and block on a per-call reply channel for their outcome.
//! This mirrors the teacher's dispatcher-owns-a-worker-thread shape, just
//! with a bounded `sync_channel` standing in for backpressure instead of an
//! unbounded queue.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::BatcherConfig;
use crate::event_store::{LocalStore, Submission, SubmissionOutcome};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("transaction batcher queue is full")]
    QueueFull,
    #[error("transaction batcher has shut down")]
    Stopped,
}

struct PendingSubmission {
    submission: Submission,
    reply: mpsc::Sender<SubmissionOutcome>,
}

enum BatcherMessage {
    Submit(PendingSubmission),
    Shutdown,
}

pub struct TransactionBatcher {
    tx: SyncSender<BatcherMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TransactionBatcher {
    pub fn new<S: LocalStore + 'static>(store: Arc<S>, config: BatcherConfig) -> Self {
        info!(worker = "batcher", max_queue_depth = config.max_queue_depth, "starting");
        let (tx, rx) = mpsc::sync_channel(config.max_queue_depth);
        let handle = thread::spawn(move || run_loop(store, config, rx));
        Self { tx, handle: Some(handle) }
    }

    /// Blocks until this submission's batch has been flushed and returns its
    /// own outcome, unaffected by any sibling submission's failure.
    pub fn submit(&self, submission: Submission) -> Result<SubmissionOutcome, SubmitError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .try_send(BatcherMessage::Submit(PendingSubmission { submission, reply: reply_tx }))
            .map_err(|e| match e {
                mpsc::TrySendError::Full(_) => SubmitError::QueueFull,
                mpsc::TrySendError::Disconnected(_) => SubmitError::Stopped,
            })?;
        reply_rx.recv().map_err(|_| SubmitError::Stopped)
    }

    /// Stops accepting new work and blocks until the background thread has
    /// drained and flushed everything already queued.
    pub fn stop(mut self) {
        info!(worker = "batcher", "shutting down");
        let _ = self.tx.send(BatcherMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TransactionBatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(BatcherMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop<S: LocalStore>(store: Arc<S>, config: BatcherConfig, rx: Receiver<BatcherMessage>) {
    let mut pending: Vec<PendingSubmission> = Vec::new();
    let mut deadline = Instant::now() + config.flush_interval();

    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(BatcherMessage::Submit(p)) => {
                pending.push(p);
                if pending.len() >= config.batch_size_threshold {
                    flush(&store, &mut pending);
                    deadline = Instant::now() + config.flush_interval();
                }
            }
            Ok(BatcherMessage::Shutdown) => {
                flush(&store, &mut pending);
                // Drain anything queued up before the sender side closed.
                while let Ok(msg) = rx.try_recv() {
                    if let BatcherMessage::Submit(p) = msg {
                        pending.push(p);
                    }
                }
                flush(&store, &mut pending);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                flush(&store, &mut pending);
                deadline = Instant::now() + config.flush_interval();
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush(&store, &mut pending);
                return;
            }
        }
    }
}

fn flush<S: LocalStore>(store: &Arc<S>, pending: &mut Vec<PendingSubmission>) {
    if pending.is_empty() {
        return;
    }
    let drained: Vec<PendingSubmission> = std::mem::take(pending);
    let batch_len = drained.len();
    let submissions: Vec<Submission> = drained.iter().map(|p| p.submission.clone()).collect();
    let outcomes = store.apply_batch(&submissions);
    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    if failed > 0 {
        warn!(worker = "batcher", batch_len, failed, "flush completed with failed submissions");
    } else {
        info!(worker = "batcher", batch_len, "flush completed");
    }
    for (p, outcome) in drained.into_iter().zip(outcomes.into_iter()) {
        let _ = p.reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryLocalStore, Mutation, UncommittedEvent};
    use commercebus_core::{AggregateId, ExpectedVersion};

    fn uncommitted(aggregate_id: AggregateId) -> UncommittedEvent {
        UncommittedEvent {
            aggregate_id,
            aggregate_type: "order".to_string(),
            event_type: "OrderPlaced".to_string(),
            correlation_id: None,
            occurred_at: chrono::Utc::now(),
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn coalesces_concurrent_submissions_into_one_flush() {
        let store = Arc::new(InMemoryLocalStore::default());
        let batcher = Arc::new(TransactionBatcher::new(store, BatcherConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let batcher = Arc::clone(&batcher);
            handles.push(thread::spawn(move || {
                let aggregate_id = AggregateId::new();
                batcher
                    .submit(Submission {
                        mutations: vec![Mutation::AppendEvent {
                            event: uncommitted(aggregate_id),
                            expected_version: ExpectedVersion::Exact(0),
                        }],
                    })
                    .unwrap()
            }));
        }

        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
    }

    #[test]
    fn one_failing_submission_does_not_fail_its_batch_mates() {
        let store = Arc::new(InMemoryLocalStore::default());
        let batcher = TransactionBatcher::new(store, BatcherConfig::default());

        let shared_aggregate = AggregateId::new();
        // Seed version 1 so the second submission's `Exact(0)` is wrong.
        batcher
            .submit(Submission {
                mutations: vec![Mutation::AppendEvent {
                    event: uncommitted(shared_aggregate),
                    expected_version: ExpectedVersion::Exact(0),
                }],
            })
            .unwrap()
            .unwrap();

        let ok_aggregate = AggregateId::new();
        let conflicting = batcher.submit(Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(shared_aggregate),
                expected_version: ExpectedVersion::Exact(0),
            }],
        });
        let clean = batcher.submit(Submission {
            mutations: vec![Mutation::AppendEvent {
                event: uncommitted(ok_aggregate),
                expected_version: ExpectedVersion::Exact(0),
            }],
        });

        assert!(conflicting.unwrap().is_err());
        assert!(clean.unwrap().is_ok());
    }
}
