pub mod pool;
pub mod task;

pub use pool::{TaskQueue, WorkerPool};
pub use task::{EnqueueOptions, Envelope, JobQueue, QueueTask, TaskError, TaskHandler};

// Re-export crossbeam_channel for use in the worker binary
pub use crossbeam_channel;
