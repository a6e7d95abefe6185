//! Fakes shared by the engine's unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;

use crate::completion::{Completion, CompletionClient, CompletionError, CompletionRequest, ContentPart};
use crate::db::job_repo::{self, NewJob};
use crate::db::Database;
use crate::error::WorkerError;
use crate::job::{JobConfig, JobStatus};
use crate::splitter::{Blocks, ContentBlock, DocumentSplitter, SplitError, SplitOptions};
use crate::worker::{EnqueueOptions, JobQueue, QueueTask};

/// Creates a CONFIGURED job with `prompt` and an attached file at `file_path`.
pub(crate) fn configured_job(db: &Database, prompt: &str, file_path: &str) -> i64 {
    db.with_conn(|conn| {
        let id = job_repo::insert(
            conn,
            &NewJob {
                owner: "u1".to_string(),
                ..Default::default()
            },
        )?;
        job_repo::set_status(conn, id, JobStatus::Uploaded)?;
        let name = std::path::Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        job_repo::set_file(conn, id, file_path, &name)?;
        job_repo::set_configs(
            conn,
            id,
            &JobConfig {
                prompt: Some(prompt.to_string()),
                ..Default::default()
            },
        )?;
        job_repo::set_status(conn, id, JobStatus::Configured)?;
        Ok(id)
    })
    .unwrap()
}

#[derive(Default)]
pub(crate) struct RecordingQueue {
    tasks: Mutex<Vec<QueueTask>>,
    failing: Mutex<Vec<QueueTask>>,
}

impl RecordingQueue {
    pub(crate) fn tasks(&self) -> Vec<QueueTask> {
        self.tasks.lock().unwrap().clone()
    }

    /// Makes enqueueing `task` fail.
    pub(crate) fn fail_on(&self, task: QueueTask) {
        self.failing.lock().unwrap().push(task);
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, task: QueueTask, _options: EnqueueOptions) -> Result<(), WorkerError> {
        if self.failing.lock().unwrap().contains(&task) {
            return Err(WorkerError::ChannelClosed);
        }
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

/// Completion client that answers `echo: <text>` unless a result was
/// scripted with [`push`](Self::push).
#[derive(Default)]
pub(crate) struct ScriptedClient {
    scripted: Mutex<VecDeque<Result<Completion, CompletionError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Mutex<Duration>,
    on_call: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl ScriptedClient {
    pub(crate) fn push(&self, result: Result<Completion, CompletionError>) {
        self.scripted.lock().unwrap().push_back(result);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn on_call(&self, hook: impl Fn() + Send + 'static) {
        *self.on_call.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl CompletionClient for ScriptedClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(hook) = self.on_call.lock().unwrap().as_ref() {
            hook();
        }

        if let Some(result) = self.scripted.lock().unwrap().pop_front() {
            return result;
        }

        let text = request
            .parts
            .iter()
            .find_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(Completion {
            provider: "scripted".to_string(),
            model: request.model.clone(),
            text: format!("echo: {}", text),
            tokens_used: 3,
            raw: json!({ "id": "cmpl-test" }),
        })
    }
}

/// Splitter returning a fixed list of blocks for any path.
pub(crate) struct StaticSplitter {
    blocks: Vec<ContentBlock>,
    fail_at: Option<usize>,
}

impl StaticSplitter {
    pub(crate) fn new(blocks: Vec<ContentBlock>) -> Self {
        Self {
            blocks,
            fail_at: None,
        }
    }

    /// Yields a read error in place of the block at `position` (0-based)
    /// and stops there.
    pub(crate) fn failing_at(mut self, position: usize) -> Self {
        self.fail_at = Some(position);
        self
    }
}

impl DocumentSplitter for StaticSplitter {
    fn split(&self, _path: &std::path::Path, _options: &SplitOptions) -> Result<Blocks, SplitError> {
        let fail_at = self.fail_at;
        Ok(Box::new(
            self.blocks
                .clone()
                .into_iter()
                .enumerate()
                .take(fail_at.map_or(usize::MAX, |p| p + 1))
                .map(move |(i, block)| {
                    if Some(i) == fail_at {
                        Err(SplitError::Pdf(format!("page {} is unreadable", i + 1)))
                    } else {
                        Ok(block)
                    }
                }),
        ))
    }
}
