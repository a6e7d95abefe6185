pub mod broadcast;
pub mod completion;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod job;
pub mod prompt;
pub mod secrets;
pub mod splitter;
pub mod worker;

pub use broadcast::{NoopNotifier, NotificationChannel, UnitNotification, UnitProgressBroadcaster};
pub use completion::{Completion, CompletionClient, CompletionError, CompletionRequest, OpenAiClient};
pub use config::{load_config, EngineConfig, LogFormat};
pub use db::Database;
pub use engine::{Engine, JobStatusView, Page, RunOutcome, UnitStatusView, UnitView};
pub use error::{ConfigError, EngineError, FanoutError, Result, WorkerError};
pub use job::{DocumentMode, JobConfig, JobStatus, UnitCounts, UnitStatus};
pub use secrets::{SecretError, SecretSource};
pub use splitter::{ContentBlock, DocumentSplitter, FileSplitter};
pub use worker::{TaskQueue, WorkerPool};
