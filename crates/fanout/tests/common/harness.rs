//! Test harness for isolated engine runs.
//!
//! Each harness owns an in-memory store, a temp directory for input files and
//! an engine. With [`TestHarness::new`] a worker pool drains the queue in the
//! background; with [`TestHarness::manual`] tests pull envelopes off the
//! queue themselves and decide when and how often each one runs.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use fanout::config::EngineConfig;
use fanout::db::job_repo::NewJob;
use fanout::worker::crossbeam_channel::Receiver;
use fanout::worker::{Envelope, TaskHandler};
use fanout::{
    Database, Engine, FileSplitter, JobConfig, TaskQueue, UnitProgressBroadcaster, WorkerPool,
};

use super::FakeCompletionClient;

pub struct TestHarness {
    temp_dir: TempDir,
    pub db: Database,
    pub client: Arc<FakeCompletionClient>,
    pub broadcaster: Arc<UnitProgressBroadcaster>,
    pub queue: TaskQueue,
    pub engine: Arc<Engine>,
    pool: Option<WorkerPool>,
    receiver: Option<Receiver<Envelope>>,
}

/// Engine settings for tests: no retry delay, short leases.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker_count = 4;
    config.retry.retry_delay_secs = 0;
    config
}

impl TestHarness {
    /// Harness with four background workers.
    pub fn new() -> Self {
        Self::build(FakeCompletionClient::default(), true)
    }

    /// Harness whose queue is drained by the test.
    pub fn manual() -> Self {
        Self::build(FakeCompletionClient::default(), false)
    }

    pub fn manual_with_client(client: FakeCompletionClient) -> Self {
        Self::build(client, false)
    }

    fn build(client: FakeCompletionClient, with_workers: bool) -> Self {
        let config = test_config();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_in_memory().expect("Failed to open database");
        let client = Arc::new(client);
        let broadcaster = Arc::new(UnitProgressBroadcaster::new(64));
        let (queue, receiver) = TaskQueue::new();

        let engine = Arc::new(Engine::new(
            &config,
            db.clone(),
            Arc::new(queue.clone()),
            client.clone(),
            broadcaster.clone(),
            Arc::new(FileSplitter),
        ));

        let (pool, receiver) = if with_workers {
            let pool = WorkerPool::spawn(
                queue.clone(),
                receiver,
                engine.clone(),
                config.worker_count,
            )
            .expect("Failed to start workers");
            (Some(pool), None)
        } else {
            (None, Some(receiver))
        };

        Self {
            temp_dir,
            db,
            client,
            broadcaster,
            queue,
            engine,
            pool,
            receiver,
        }
    }

    /// Writes `content` to a file in the harness temp directory.
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }

    /// Creates a job, attaches `file` and configures `prompt`.
    pub fn configured_job(&self, file: &PathBuf, prompt: &str) -> i64 {
        let job = self
            .engine
            .create_job(&NewJob {
                owner: "tester".to_string(),
                title: Some("integration".to_string()),
                description: None,
            })
            .expect("create_job");
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.engine
            .attach_file(job.id, &file.to_string_lossy(), &name)
            .expect("attach_file");
        self.engine
            .configure_job(
                job.id,
                &JobConfig {
                    prompt: Some(prompt.to_string()),
                    ..Default::default()
                },
            )
            .expect("configure_job");
        job.id
    }

    /// Blocks until the worker pool has nothing left to do.
    pub fn wait_idle(&self) {
        let pool = self.pool.as_ref().expect("harness has no workers");
        assert!(
            pool.wait_idle(Duration::from_secs(10)),
            "workers did not go idle"
        );
    }

    /// Removes and returns every envelope currently queued.
    pub fn take_queued(&self) -> Vec<Envelope> {
        let receiver = self.receiver.as_ref().expect("harness has workers");
        receiver.try_iter().collect()
    }

    /// Handles queued envelopes in the calling thread until none remain.
    /// Retryable failures are redelivered immediately while budget remains.
    pub fn drain(&self) {
        loop {
            let envelopes = self.take_queued();
            if envelopes.is_empty() {
                break;
            }
            for envelope in envelopes {
                self.handle_with_retries(envelope);
            }
        }
    }

    fn handle_with_retries(&self, mut envelope: Envelope) {
        loop {
            match self.engine.handle(&envelope) {
                Err(fanout::worker::TaskError::Retryable(_)) if !envelope.is_final_attempt() => {
                    envelope = envelope.next_attempt();
                }
                _ => break,
            }
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.wait();
        }
    }
}
