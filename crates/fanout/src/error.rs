use std::path::PathBuf;
use thiserror::Error;

use crate::completion::CompletionError;
use crate::db::DatabaseError;
use crate::job::{InvalidJobConfig, InvalidTransition};
use crate::prompt::PromptError;
use crate::secrets::SecretError;
use crate::splitter::SplitError;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Completion client error: {0}")]
    Completion(#[from] CompletionError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to resolve secret: {0}")]
    Secret(#[from] SecretError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,
}

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Task unit {unit_id} not found in job {job_id}")]
    UnitNotFound { job_id: i64, unit_id: i64 },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A required job setting is absent; the user must configure it.
    #[error("Job {job_id} is missing required configuration '{field}'")]
    MissingConfiguration { job_id: i64, field: &'static str },

    #[error(transparent)]
    InvalidConfiguration(#[from] InvalidJobConfig),

    #[error("Prompt placeholder '{{{0}}}' has no matching field")]
    MissingPlaceholderValue(String),

    #[error("Job {0} has no uploaded file")]
    NoFileAttached(i64),

    #[error("Document split failed: {0}")]
    Split(#[from] SplitError),

    #[error("Completion failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("Queue error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for EngineError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { entity: "job", id } => EngineError::JobNotFound(id),
            DatabaseError::InvalidTransition(t) => EngineError::InvalidTransition(t),
            other => EngineError::Database(other),
        }
    }
}

impl From<PromptError> for EngineError {
    fn from(e: PromptError) -> Self {
        match e {
            PromptError::MissingPlaceholderValue(name) => EngineError::MissingPlaceholderValue(name),
        }
    }
}

impl EngineError {
    /// Errors the user fixes by changing the job rather than by retrying.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            EngineError::MissingConfiguration { .. }
                | EngineError::InvalidConfiguration(_)
                | EngineError::MissingPlaceholderValue(_)
                | EngineError::NoFileAttached(_)
                | EngineError::InvalidTransition(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FanoutError>;
