//! Blocking operation queue.
//!
//! A serialisation primitive for funnelling commands from many concurrent
//! submitters through a single consumer. Key properties:
//!
//! - **Synchronous verdicts**: `enqueue` resolves with the verdict the
//!   consumer produced for that exact operation, so the submitter learns
//!   whether its command was applied.
//! - **Deadlines**: every operation carries a deadline. An operation whose
//!   deadline elapses before the consumer accepts it is withdrawn and the
//!   consumer never observes it.
//! - **Strict alternation**: the consumer must deliver a verdict for the
//!   previous operation before it is handed the next one.
//!
//! # Invariants
//!
//! - Exactly one verdict is returned per accepted operation
//! - Operations from a single submitter are observed in submission order;
//!   no global order is guaranteed across submitters
//! - Shutdown promptly fails pending and future `enqueue` calls
//!
//! Each operation moves through `New → Offered → Delivered → Verdicted →
//! Returned`, or short-circuits to `TimedOut` (deadline) or `Cancelled`
//! (shutdown).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

/// An opaque command submitted to the queue.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Command payload handed to the consumer.
    pub command: Vec<u8>,

    /// Point in time after which the submitter gives up waiting.
    pub deadline: Instant,
}

impl Operation {
    /// Create an operation from a command payload and a deadline.
    pub fn new(command: impl Into<Vec<u8>>, deadline: Instant) -> Self {
        Self {
            command: command.into(),
            deadline,
        }
    }
}

/// Errors returned to submitters.
#[derive(Debug, Error)]
pub enum Error<E> {
    /// The deadline elapsed before the consumer produced a verdict.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The queue was shut down.
    #[error("queue closed")]
    Closed,

    /// The consumer rejected the operation.
    #[error("operation rejected: {0}")]
    Verdict(E),
}

type Reply<E> = oneshot::Sender<Result<(), E>>;

struct Shared<E> {
    /// In-flight operations by id. An entry is removed exactly once: by the
    /// consumer when it delivers the verdict, or by the submitter when it
    /// withdraws on timeout or shutdown. Whoever loses the race finds the
    /// entry absent and discards its side.
    pending: Mutex<HashMap<u64, Reply<E>>>,
}

/// Submitter handle. Cheap to clone; all clones feed the same consumer.
pub struct OpQueue<E> {
    shared: Arc<Shared<E>>,
    ops_tx: mpsc::Sender<(u64, Operation)>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for OpQueue<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            ops_tx: self.ops_tx.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<E> OpQueue<E> {
    /// Create a queue and its consumer endpoint.
    pub fn new() -> (OpQueue<E>, OpConsumer<E>) {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
        });
        let (ops_tx, ops_rx) = mpsc::channel(1);

        let queue = OpQueue {
            shared: Arc::clone(&shared),
            ops_tx,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        let consumer = OpConsumer {
            shared,
            ops_rx,
            inflight: None,
        };
        (queue, consumer)
    }

    /// Submit an operation and wait for the consumer's verdict.
    ///
    /// Blocks until the consumer has accepted the operation and delivered a
    /// verdict, the operation's deadline passes, or the queue is shut down.
    /// A deadline already in the past still makes a non-blocking offer, so a
    /// ready consumer can win the race.
    pub async fn enqueue(&self, op: Operation) -> Result<(), Error<E>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.lock_pending().insert(id, reply_tx);

        let deadline = op.deadline;

        // Offer the operation, racing the deadline. `biased` keeps the offer
        // ahead of an already-expired timer.
        tokio::select! {
            biased;
            sent = self.ops_tx.send((id, op)) => {
                if sent.is_err() {
                    self.lock_pending().remove(&id);
                    return Err(Error::Closed);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.lock_pending().remove(&id);
                return Err(Error::DeadlineExceeded);
            }
        }

        // Wait for the verdict, still racing the deadline.
        tokio::select! {
            biased;
            verdict = &mut reply_rx => Self::finish(verdict),
            _ = tokio::time::sleep_until(deadline) => {
                // Withdraw. An absent entry means the consumer has claimed
                // the operation and its verdict is imminent.
                if self.lock_pending().remove(&id).is_some() {
                    return Err(Error::DeadlineExceeded);
                }
                Self::finish(reply_rx.await)
            }
        }
    }

    fn finish(verdict: Result<Result<(), E>, oneshot::error::RecvError>) -> Result<(), Error<E>> {
        match verdict {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Verdict(e)),
            Err(_) => Err(Error::Closed),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Reply<E>>> {
        self.shared.pending.lock().expect("opqueue lock poisoned")
    }
}

/// Consumer endpoint. There is exactly one per queue.
pub struct OpConsumer<E> {
    shared: Arc<Shared<E>>,
    ops_rx: mpsc::Receiver<(u64, Operation)>,
    inflight: Option<u64>,
}

impl<E> OpConsumer<E> {
    /// Yield the next accepted operation.
    ///
    /// Operations whose submitter withdrew before delivery are silently
    /// discarded. Returns `None` once every submitter handle is gone or the
    /// queue has been shut down and drained.
    ///
    /// # Panics
    ///
    /// Panics if called while the verdict for the previously yielded
    /// operation is still outstanding.
    pub async fn next(&mut self) -> Option<Operation> {
        assert!(
            self.inflight.is_none(),
            "verdict outstanding for previous operation"
        );
        loop {
            let (id, op) = self.ops_rx.recv().await?;
            if self.lock_pending().contains_key(&id) {
                self.inflight = Some(id);
                return Some(op);
            }
            debug!(op_id = id, "discarding withdrawn operation");
        }
    }

    /// Deliver the verdict for the operation last yielded by [`next`].
    ///
    /// If the submitter timed out in the meantime the verdict is discarded.
    ///
    /// # Panics
    ///
    /// Panics if no operation is awaiting a verdict.
    ///
    /// [`next`]: OpConsumer::next
    pub fn ack(&mut self, verdict: Result<(), E>) {
        let id = self
            .inflight
            .take()
            .expect("ack without a delivered operation");
        // Remove-then-signal: holding the entry is what entitles us to reply.
        match self.lock_pending().remove(&id) {
            Some(reply) => {
                let _ = reply.send(verdict);
            }
            None => debug!(op_id = id, "discarding verdict for withdrawn operation"),
        }
    }

    /// Shut the queue down.
    ///
    /// Pending and future `enqueue` calls fail with [`Error::Closed`].
    /// Calling this more than once is harmless.
    pub fn shutdown(&mut self) {
        self.ops_rx.close();
        self.inflight = None;
        // Dropping the reply senders resolves every waiting submitter.
        self.lock_pending().clear();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Reply<E>>> {
        self.shared.pending.lock().expect("opqueue lock poisoned")
    }
}

impl<E> Drop for OpConsumer<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn op(command: &str, deadline: Instant) -> Operation {
        Operation::new(command.as_bytes().to_vec(), deadline)
    }

    fn command_of(operation: &Operation) -> String {
        String::from_utf8(operation.command.clone()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_returns_consumer_verdict() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let consumer_seen = Arc::clone(&seen);
        let worker = tokio::spawn(async move {
            while let Some(operation) = consumer.next().await {
                consumer_seen.lock().unwrap().push(command_of(&operation));
                consumer.ack(Ok(()));
            }
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        queue.enqueue(op("abc-0", deadline)).await.unwrap();

        drop(queue);
        worker.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["abc-0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_returns_consumer_error() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let worker = tokio::spawn(async move {
            let operation = consumer.next().await.unwrap();
            assert_eq!(command_of(&operation), "abc-0");
            consumer.ack(Err("boom".to_string()));
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        let err = queue.enqueue(op("abc-0", deadline)).await.unwrap_err();
        assert!(matches!(err, Error::Verdict(ref e) if e == "boom"));

        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_times_out_without_consumer() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let deadline = Instant::now() + Duration::from_nanos(1);
        let err = queue.enqueue(op("abc-1", deadline)).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        // The withdrawn operation is never observed once the consumer runs.
        drop(queue);
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tight_deadline_still_reaches_a_ready_consumer() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let worker = tokio::spawn(async move {
            while let Some(operation) = consumer.next().await {
                assert_eq!(command_of(&operation), "abc-0");
                consumer.ack(Ok(()));
            }
        });

        // The consumer is parked on `next`, so the offer is taken before
        // the almost-expired deadline can fire.
        queue
            .enqueue(op("abc-0", Instant::now() + Duration::from_nanos(1)))
            .await
            .unwrap();

        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn operations_from_one_submitter_arrive_in_order() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let consumer_seen = Arc::clone(&seen);
        let worker = tokio::spawn(async move {
            while let Some(operation) = consumer.next().await {
                consumer_seen.lock().unwrap().push(command_of(&operation));
                consumer.ack(Ok(()));
            }
        });

        for i in 0..2 {
            let deadline = Instant::now() + Duration::from_secs(1);
            queue
                .enqueue(op(&format!("abc-{i}"), deadline))
                .await
                .unwrap();
        }

        drop(queue);
        worker.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["abc-0", "abc-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_operations_are_withdrawn_while_consumer_is_busy() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let consumer_seen = Arc::clone(&seen);
        let worker = tokio::spawn(async move {
            let mut first = true;
            while let Some(operation) = consumer.next().await {
                consumer_seen.lock().unwrap().push(command_of(&operation));
                consumer.ack(Ok(()));
                if first {
                    first = false;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        });

        // Accepted and acknowledged while the consumer is ready.
        queue
            .enqueue(op("abc-0", Instant::now() + Duration::from_secs(1)))
            .await
            .unwrap();

        // The consumer is now asleep; this deadline expires first.
        let err = queue
            .enqueue(op("abc-1", Instant::now() + Duration::from_nanos(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        // Outlives the consumer's nap, so it is observed and acknowledged.
        queue
            .enqueue(op("abc-2", Instant::now() + Duration::from_millis(100)))
            .await
            .unwrap();

        drop(queue);
        worker.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["abc-0", "abc-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submitters_all_get_verdicts() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let consumer_seen = Arc::clone(&seen);
        let worker = tokio::spawn(async move {
            while let Some(operation) = consumer.next().await {
                consumer_seen.lock().unwrap().push(command_of(&operation));
                consumer.ack(Ok(()));
            }
        });

        let mut submitters = Vec::new();
        for i in 0..10 {
            let queue = queue.clone();
            submitters.push(tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(1);
                queue.enqueue(op(&format!("abc-{i}"), deadline)).await
            }));
        }
        for submitter in submitters {
            submitter.await.unwrap().unwrap();
        }

        drop(queue);
        worker.await.unwrap();

        let mut received = seen.lock().unwrap().clone();
        received.sort();
        let expected: Vec<String> = (0..10).map(|i| format!("abc-{i}")).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn late_verdict_for_timed_out_operation_is_discarded() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let worker = tokio::spawn(async move {
            // First operation: accepted, then acknowledged after its
            // submitter's deadline has already passed.
            let operation = consumer.next().await.unwrap();
            assert_eq!(command_of(&operation), "abc-0");
            tokio::time::sleep(Duration::from_millis(10)).await;
            consumer.ack(Ok(()));

            // The queue keeps working for later operations.
            let operation = consumer.next().await.unwrap();
            assert_eq!(command_of(&operation), "abc-1");
            consumer.ack(Ok(()));
        });

        let err = queue
            .enqueue(op("abc-0", Instant::now() + Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        queue
            .enqueue(op("abc-1", Instant::now() + Duration::from_secs(1)))
            .await
            .unwrap();

        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_pending_enqueue() {
        let (queue, mut consumer) = OpQueue::<String>::new();

        let submitter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(op("abc-0", Instant::now() + Duration::from_secs(60)))
                    .await
            })
        };

        // Let the submitter park in the queue before shutting down.
        tokio::task::yield_now().await;
        consumer.shutdown();
        consumer.shutdown(); // idempotent

        let err = submitter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed));

        let err = queue
            .enqueue(op("abc-1", Instant::now() + Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
