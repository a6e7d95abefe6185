use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use super::task::{EnqueueOptions, Envelope, JobQueue, QueueTask, TaskError, TaskHandler};
use crate::error::WorkerError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// In-process task queue shared by producers and the worker pool.
///
/// Cloning is cheap. The channel is unbounded so a worker that enqueues
/// follow-up work (a dispatch enqueuing its units) can never block on the
/// workers that would drain it.
#[derive(Clone)]
pub struct TaskQueue {
    sender: Sender<Envelope>,
    closed: Arc<AtomicBool>,
    /// Envelopes enqueued, running or waiting for redelivery.
    pending: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub fn new() -> (Self, Receiver<Envelope>) {
        let (sender, receiver) = unbounded();
        let queue = Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(AtomicUsize::new(0)),
        };
        (queue, receiver)
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), WorkerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::ChannelClosed);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.sender.send(envelope).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            WorkerError::ChannelClosed
        })
    }

    /// Rejects further enqueues.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tasks not yet finished, including those waiting for a retry.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn finish_one(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl JobQueue for TaskQueue {
    fn enqueue(&self, task: QueueTask, options: EnqueueOptions) -> Result<(), WorkerError> {
        debug!("Enqueue {}", task);
        self.send(Envelope::new(task, options))
    }
}

/// A retry waiting for its delay to elapse. Ordered by due time, earliest
/// first when popped from a max-heap.
struct Delayed {
    due: Instant,
    seq: u64,
    envelope: Envelope,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct WorkerPool {
    queue: TaskQueue,
    workers: Vec<JoinHandle<()>>,
    retry_thread: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` threads that pull envelopes from `receiver` and
    /// hand them to `handler`.
    ///
    /// A `Retryable` failure is redelivered after the envelope's retry delay
    /// until its retry budget is spent.
    pub fn spawn(
        queue: TaskQueue,
        receiver: Receiver<Envelope>,
        handler: Arc<dyn TaskHandler>,
        worker_count: usize,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (retry_sender, retry_receiver) = unbounded::<(Duration, Envelope)>();

        let retry_thread = {
            let queue = queue.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("fanout-retry".to_string())
                .spawn(move || run_retry_timer(retry_receiver, queue, shutdown))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?
        };

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = receiver.clone();
            let queue = queue.clone();
            let retries = retry_sender.clone();
            let handler = Arc::clone(&handler);
            let shutdown_flag = Arc::clone(&shutdown);

            let handle = thread::Builder::new()
                .name(format!("fanout-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, rx, queue, retries, handler, shutdown_flag))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            queue,
            workers,
            retry_thread,
            shutdown,
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Blocks until no task is queued, running or awaiting retry, or until
    /// `timeout` passes. Returns whether the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.queue.pending() == 0 {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.queue.pending() == 0
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.queue.close();
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops the pool and joins every thread. Tasks still queued are dropped;
    /// the recovery sweep picks their work up from the store.
    pub fn wait(self) {
        self.shutdown();

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        if let Err(e) = self.retry_thread.join() {
            error!("Retry timer panicked: {:?}", e);
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    receiver: Receiver<Envelope>,
    queue: TaskQueue,
    retries: Sender<(Duration, Envelope)>,
    handler: Arc<dyn TaskHandler>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Acquire) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(envelope) => {
                let _span = tracing::info_span!(
                    "worker.task",
                    worker_id,
                    kind = envelope.task.kind(),
                    attempt = envelope.attempt
                )
                .entered();

                let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&envelope)))
                    .unwrap_or_else(|_| Err(TaskError::Permanent("task handler panicked".to_string())));

                match outcome {
                    Ok(()) => debug!("Worker {} finished {}", worker_id, envelope.task),
                    Err(TaskError::Retryable(reason)) if !envelope.is_final_attempt() => {
                        let delay = envelope.options.retry_delay;
                        warn!(
                            "{} failed on attempt {} ({}); retrying in {:?}",
                            envelope.task,
                            envelope.attempt + 1,
                            reason,
                            delay
                        );
                        queue.pending.fetch_add(1, Ordering::AcqRel);
                        if retries.send((delay, envelope.next_attempt())).is_err() {
                            queue.finish_one();
                            error!("Retry timer gone; dropping {}", envelope.task);
                        }
                    }
                    Err(e) => error!(
                        "{} failed permanently after {} attempt(s): {}",
                        envelope.task,
                        envelope.attempt + 1,
                        e
                    ),
                }
                queue.finish_one();
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} task channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Holds retries until their delay elapses, then puts them back on the queue.
fn run_retry_timer(
    receiver: Receiver<(Duration, Envelope)>,
    queue: TaskQueue,
    shutdown: Arc<AtomicBool>,
) {
    let mut heap: BinaryHeap<Delayed> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|d| d.due <= now) {
            if let Some(delayed) = heap.pop() {
                // Already counted as pending when it was scheduled.
                if queue.sender.send(delayed.envelope).is_err() {
                    queue.finish_one();
                }
            }
        }

        let wait = heap
            .peek()
            .map(|d| d.due.saturating_duration_since(now).min(POLL_INTERVAL))
            .unwrap_or(POLL_INTERVAL);

        match receiver.recv_timeout(wait) {
            Ok((delay, envelope)) => {
                seq += 1;
                heap.push(Delayed {
                    due: Instant::now() + delay,
                    seq,
                    envelope,
                });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) if heap.is_empty() => break,
            Err(RecvTimeoutError::Disconnected) => thread::sleep(wait),
        }
    }
}
