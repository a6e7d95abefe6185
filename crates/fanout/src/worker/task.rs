//! Units of background work and the seams between producers and workers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::WorkerError;

/// A message on the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueTask {
    /// Start (or restart) a job run.
    RunJob { job_id: i64 },
    /// Split the job's file into units and enqueue them.
    DispatchJob { job_id: i64 },
    /// Execute one unit at the generation it was dispatched with.
    ExecuteUnit { unit_id: i64, generation: i64 },
    /// One recovery sweep.
    Sweep,
}

impl QueueTask {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueTask::RunJob { .. } => "run_job",
            QueueTask::DispatchJob { .. } => "dispatch_job",
            QueueTask::ExecuteUnit { .. } => "execute_unit",
            QueueTask::Sweep => "sweep",
        }
    }
}

impl fmt::Display for QueueTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueTask::RunJob { job_id } => write!(f, "run_job(job={})", job_id),
            QueueTask::DispatchJob { job_id } => write!(f, "dispatch_job(job={})", job_id),
            QueueTask::ExecuteUnit {
                unit_id,
                generation,
            } => write!(f, "execute_unit(unit={}, gen={})", unit_id, generation),
            QueueTask::Sweep => f.write_str("sweep"),
        }
    }
}

/// Retry policy attached to a task when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Redeliveries allowed after the first attempt fails.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl EnqueueOptions {
    pub const NO_RETRY: EnqueueOptions = EnqueueOptions {
        max_retries: 0,
        retry_delay: Duration::ZERO,
    };

    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(10))
    }
}

/// A task plus its delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub task: QueueTask,
    /// Zero-based delivery attempt.
    pub attempt: u32,
    pub options: EnqueueOptions,
}

impl Envelope {
    pub fn new(task: QueueTask, options: EnqueueOptions) -> Self {
        Self {
            task,
            attempt: 0,
            options,
        }
    }

    /// No redelivery follows a failure of this attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.options.max_retries
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            task: self.task.clone(),
            attempt: self.attempt + 1,
            options: self.options,
        }
    }
}

/// Failure reported by a task handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Worth another attempt if the retry budget allows.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help.
    #[error("{0}")]
    Permanent(String),
}

/// Producer side of the task queue.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, task: QueueTask, options: EnqueueOptions) -> Result<(), WorkerError>;
}

/// Consumer side: runs one delivered task.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<(), TaskError>;
}
