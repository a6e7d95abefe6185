//! The orchestration engine.
//!
//! [`Engine`] is the surface collaborators call (create, configure, run and
//! inspect jobs) and the [`TaskHandler`] the worker pool drives. The work
//! itself lives in the components it wires together:
//!
//! - [`Supervisor`]: job runs, submissions and status rollup
//! - [`Dispatcher`]: file to task units
//! - [`Executor`]: one unit against the completion API
//! - [`RecoverySweeper`]: periodic recovery of lost work

pub mod cache;
pub mod dispatcher;
pub mod executor;
pub mod supervisor;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::broadcast::NotificationChannel;
use crate::completion::CompletionClient;
use crate::config::EngineConfig;
use crate::db::job_repo::{self, JobRecord, NewJob};
use crate::db::unit_repo::{self, UnitRecord};
use crate::db::{response_repo, Database, DatabaseError};
use crate::error::EngineError;
use crate::job::{JobConfig, JobStatus, UnitCounts, UnitStatus};
use crate::splitter::{ContentBlock, DocumentFormat, DocumentSplitter, SplitOptions};
use crate::worker::{EnqueueOptions, Envelope, JobQueue, QueueTask, TaskError, TaskHandler};

pub use cache::JobCache;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use executor::{ExecuteOutcome, Executor, ExecutorSettings, SkipReason};
pub use supervisor::{RunOutcome, Supervisor};
pub use sweeper::{RecoveryScheduler, RecoverySweeper, SweepReport, SWEEP_LOCK};

/// Unique holder name for one lease acquisition. Leases are not
/// re-entrant, so every acquisition gets its own.
pub(crate) fn lease_owner() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: i64,
    pub status: JobStatus,
    pub unit_counts: UnitCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatusView {
    pub unit_id: i64,
    pub unit_index: u32,
    pub status: UnitStatus,
    /// Normalized response of the latest attempt, if it succeeded.
    pub response: Option<Value>,
    pub error: Option<String>,
}

/// One row of a unit listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitView {
    pub unit_id: i64,
    pub unit_index: u32,
    pub status: UnitStatus,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Largest page `Page::new` hands out.
pub const MAX_PAGE_SIZE: u64 = 500;

/// A window into a unit listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u64,
    pub offset: u64,
}

impl Page {
    /// `number` is 1-based. `size` is clamped to `1..=MAX_PAGE_SIZE` and the
    /// offset saturates, so both always fit an SQLite integer.
    pub fn new(number: u64, size: u64) -> Self {
        let limit = size.clamp(1, MAX_PAGE_SIZE);
        Self {
            limit,
            offset: number
                .saturating_sub(1)
                .saturating_mul(limit)
                .min(i64::MAX as u64),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

pub struct Engine {
    db: Database,
    jobs: JobCache,
    splitter: Arc<dyn DocumentSplitter>,
    pdf_dpi: u32,
    supervisor: Supervisor,
    dispatcher: Dispatcher,
    executor: Executor,
    sweeper: RecoverySweeper,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        db: Database,
        queue: Arc<dyn JobQueue>,
        client: Arc<dyn CompletionClient>,
        notifier: Arc<dyn NotificationChannel>,
        splitter: Arc<dyn DocumentSplitter>,
    ) -> Self {
        let retry = EnqueueOptions::new(config.retry.max_retries, config.retry.retry_delay());
        let jobs = JobCache::new(db.clone(), Duration::from_secs(config.cache.job_ttl_secs));

        let supervisor = Supervisor::new(db.clone(), Arc::clone(&queue), config.job_lease(), retry);
        let dispatcher = Dispatcher::new(
            db.clone(),
            Arc::clone(&queue),
            Arc::clone(&splitter),
            config.job_lease(),
            config.splitter.pdf_dpi,
            retry,
        );
        let executor = Executor::new(
            db.clone(),
            jobs.clone(),
            client,
            notifier,
            ExecutorSettings {
                default_model: config.completion.default_model.clone(),
                max_tokens: config.completion.max_tokens,
                unit_lease: config.unit_lease(),
            },
        );
        let sweeper = RecoverySweeper::new(db.clone(), queue, config.sweeper, retry);

        Self {
            db,
            jobs,
            splitter,
            pdf_dpi: config.splitter.pdf_dpi,
            supervisor,
            dispatcher,
            executor,
            sweeper,
        }
    }

    pub fn create_job(&self, job: &NewJob) -> Result<JobRecord, EngineError> {
        let record = self.db.with_conn(|conn| {
            let id = job_repo::insert(conn, job)?;
            job_repo::get(conn, id)
        })?;
        log::info!("Created job {} for {}", record.id, record.owner);
        Ok(record)
    }

    /// Records an uploaded file. Any previous configuration is discarded.
    pub fn attach_file(
        &self,
        job_id: i64,
        file_path: &str,
        file_name: &str,
    ) -> Result<JobRecord, EngineError> {
        DocumentFormat::from_path(Path::new(file_name))?;

        let record = self.db.with_tx(|tx| {
            job_repo::set_status(tx, job_id, JobStatus::Uploaded)?;
            job_repo::set_file(tx, job_id, file_path, file_name)?;
            job_repo::get(tx, job_id)
        })?;
        self.jobs.invalidate(job_id);
        Ok(record)
    }

    pub fn configure_job(&self, job_id: i64, configs: &JobConfig) -> Result<JobRecord, EngineError> {
        configs.validate()?;

        let record = self.db.with_tx(|tx| {
            job_repo::set_status(tx, job_id, JobStatus::Configured)?;
            job_repo::set_configs(tx, job_id, configs)?;
            job_repo::get(tx, job_id)
        })?;
        self.jobs.invalidate(job_id);
        Ok(record)
    }

    /// Moves the job to PENDING and queues its run.
    pub fn submit_job(&self, job_id: i64) -> Result<JobStatus, EngineError> {
        let status = self.supervisor.submit(job_id)?;
        self.jobs.invalidate(job_id);
        Ok(status)
    }

    /// Starts a run directly, without going through the queue.
    pub fn run_job(&self, job_id: i64) -> Result<RunOutcome, EngineError> {
        let outcome = self.supervisor.run(job_id)?;
        self.jobs.invalidate(job_id);
        Ok(outcome)
    }

    /// The job with its status rolled up.
    pub fn get_job(&self, job_id: i64) -> Result<JobRecord, EngineError> {
        Ok(self.supervisor.refresh(job_id)?.0)
    }

    pub fn get_job_status(&self, job_id: i64) -> Result<JobStatusView, EngineError> {
        let (job, unit_counts) = self.supervisor.refresh(job_id)?;
        Ok(JobStatusView {
            job_id,
            status: job.status,
            unit_counts,
        })
    }

    pub fn get_unit_status(&self, job_id: i64, unit_id: i64) -> Result<UnitStatusView, EngineError> {
        self.db
            .with_conn(|conn| {
                job_repo::get(conn, job_id)?;
                let unit = unit_repo::get_for_job(conn, job_id, unit_id)?;
                let view = unit_view(conn, unit)?;
                Ok(UnitStatusView {
                    unit_id: view.unit_id,
                    unit_index: view.unit_index,
                    status: view.status,
                    response: view.response,
                    error: view.error,
                })
            })
            .map_err(|e| match e {
                DatabaseError::NotFound {
                    entity: "task unit",
                    ..
                } => EngineError::UnitNotFound { job_id, unit_id },
                other => other.into(),
            })
    }

    /// Valid units of the job in index order.
    pub fn list_units(&self, job_id: i64, page: Page) -> Result<Vec<UnitView>, EngineError> {
        let units = self.db.with_conn(|conn| {
            job_repo::get(conn, job_id)?;
            unit_repo::list_for_job(conn, job_id, page.limit, page.offset)?
                .into_iter()
                .map(|unit| unit_view(conn, unit))
                .collect::<Result<Vec<_>, _>>()
        })?;
        Ok(units)
    }

    pub fn delete_job(&self, job_id: i64) -> Result<bool, EngineError> {
        let deleted = self.db.with_conn(|conn| job_repo::delete(conn, job_id))?;
        self.jobs.invalidate(job_id);
        if deleted {
            log::info!("Deleted job {}", job_id);
        }
        Ok(deleted)
    }

    /// The first `limit` content blocks of the job's file under its current
    /// configuration.
    pub fn preview_file(&self, job_id: i64, limit: usize) -> Result<Vec<ContentBlock>, EngineError> {
        let (path, options) = self.split_target(job_id)?;
        Ok(self.splitter.preview(Path::new(&path), &options, limit)?)
    }

    /// How many content blocks the job's file yields.
    pub fn count_blocks(&self, job_id: i64) -> Result<usize, EngineError> {
        let (path, options) = self.split_target(job_id)?;
        Ok(self.splitter.count_blocks(Path::new(&path), &options)?)
    }

    fn split_target(&self, job_id: i64) -> Result<(String, SplitOptions), EngineError> {
        let job = self.db.with_conn(|conn| job_repo::get(conn, job_id))?;
        let path = job.file_path.ok_or(EngineError::NoFileAttached(job_id))?;
        Ok((path, SplitOptions::from_config(&job.configs, self.pdf_dpi)))
    }

    /// Runs one recovery sweep in the calling thread.
    pub fn sweep(&self) -> Result<Option<SweepReport>, EngineError> {
        self.sweeper.sweep()
    }

    fn handle_run(&self, job_id: i64) -> Result<(), TaskError> {
        match self.supervisor.run(job_id) {
            Ok(outcome) => {
                log::debug!("Run of job {}: {:?}", job_id, outcome);
                Ok(())
            }
            Err(EngineError::JobNotFound(_)) => {
                log::info!("Job {} no longer exists; run dropped", job_id);
                Ok(())
            }
            Err(e) if e.is_user_correctable() => {
                log::warn!("Job {} cannot run: {}", job_id, e);
                self.fail_job(job_id);
                Err(TaskError::Permanent(e.to_string()))
            }
            Err(e) => Err(TaskError::Retryable(e.to_string())),
        }
    }

    fn handle_dispatch(&self, job_id: i64) -> Result<(), TaskError> {
        match self.dispatcher.dispatch(job_id) {
            Ok(outcome) => {
                log::debug!("Dispatch of job {}: {:?}", job_id, outcome);
                Ok(())
            }
            Err(EngineError::JobNotFound(_)) => {
                log::info!("Job {} no longer exists; dispatch dropped", job_id);
                Ok(())
            }
            Err(e) => {
                log::error!("Dispatch of job {} failed: {}", job_id, e);
                self.fail_job(job_id);
                if e.is_user_correctable() {
                    Err(TaskError::Permanent(e.to_string()))
                } else {
                    Err(TaskError::Retryable(e.to_string()))
                }
            }
        }
    }

    fn handle_execute(&self, unit_id: i64, generation: i64, envelope: &Envelope) -> Result<(), TaskError> {
        let outcome = self
            .executor
            .execute(unit_id, generation, envelope.attempt, envelope.is_final_attempt())
            .map_err(|e| TaskError::Retryable(e.to_string()))?;

        match outcome {
            ExecuteOutcome::Failed {
                error,
                final_attempt: false,
            } => Err(TaskError::Retryable(error.to_string())),
            ExecuteOutcome::Failed { error, .. } => Err(TaskError::Permanent(error.to_string())),
            ExecuteOutcome::Completed | ExecuteOutcome::Skipped(_) => Ok(()),
        }
    }

    fn fail_job(&self, job_id: i64) {
        if let Err(e) = self.supervisor.mark_failed(job_id) {
            log::error!("Failed to mark job {} FAILED: {}", job_id, e);
        }
        self.jobs.invalidate(job_id);
    }
}

impl TaskHandler for Engine {
    fn handle(&self, envelope: &Envelope) -> Result<(), TaskError> {
        match envelope.task {
            QueueTask::RunJob { job_id } => self.handle_run(job_id),
            QueueTask::DispatchJob { job_id } => self.handle_dispatch(job_id),
            QueueTask::ExecuteUnit {
                unit_id,
                generation,
            } => self.handle_execute(unit_id, generation, envelope),
            QueueTask::Sweep => match self.sweeper.sweep() {
                Ok(_) => Ok(()),
                Err(e) => Err(TaskError::Permanent(e.to_string())),
            },
        }
    }
}

fn unit_view(conn: &rusqlite::Connection, unit: UnitRecord) -> Result<UnitView, DatabaseError> {
    let latest = match unit.latest_response_id {
        Some(id) => response_repo::find_by_id(conn, id)?,
        None => None,
    };

    let (request, response, error, duration_seconds) = match latest {
        Some(r) => (r.request_data, r.response_data, r.error_message, r.processing_time),
        None => (None, None, None, None),
    };

    Ok(UnitView {
        unit_id: unit.id,
        unit_index: unit.unit_index,
        status: unit.status,
        request,
        response,
        error,
        duration_seconds,
    })
}
