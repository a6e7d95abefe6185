//! Job-level lifecycle: starting runs, submissions and the read-time status
//! rollup.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

use crate::db::job_repo::{self, JobRecord};
use crate::db::{unit_repo, Database, DatabaseError};
use crate::error::EngineError;
use crate::job::{JobStatus, UnitCounts};
use crate::worker::{EnqueueOptions, JobQueue, QueueTask};

/// Result of asking for a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Previous units were invalidated and a dispatch was enqueued.
    Started,
    /// Another caller holds the job lease right now.
    AlreadyRunning,
    /// The job was already running or finished; nothing changed.
    Unchanged(JobStatus),
}

pub struct Supervisor {
    db: Database,
    queue: Arc<dyn JobQueue>,
    job_lease: Duration,
    retry: EnqueueOptions,
}

impl Supervisor {
    pub fn new(
        db: Database,
        queue: Arc<dyn JobQueue>,
        job_lease: Duration,
        retry: EnqueueOptions,
    ) -> Self {
        Self {
            db,
            queue,
            job_lease,
            retry,
        }
    }

    /// Starts a run of `job_id`.
    ///
    /// Never blocks on a concurrent run: if the job lease is taken the call
    /// returns [`RunOutcome::AlreadyRunning`].
    pub fn run(&self, job_id: i64) -> Result<RunOutcome, EngineError> {
        let owner = super::lease_owner();
        let acquired = self.db.with_conn(|conn| {
            job_repo::get(conn, job_id)?;
            job_repo::try_acquire_lease(conn, job_id, &owner, self.job_lease)
        })?;
        if !acquired {
            log::info!("Job {} is being started by another worker", job_id);
            return Ok(RunOutcome::AlreadyRunning);
        }

        let started = self.start_leased(job_id);

        if let Err(e) = self
            .db
            .with_conn(|conn| job_repo::release_lease(conn, job_id, &owner))
        {
            log::warn!("Failed to release lease on job {}: {}", job_id, e);
        }

        let outcome = started?;
        if outcome == RunOutcome::Started {
            // The lease is already released so the dispatch can take it.
            self.queue
                .enqueue(QueueTask::DispatchJob { job_id }, self.retry)?;
        }
        Ok(outcome)
    }

    fn start_leased(&self, job_id: i64) -> Result<RunOutcome, EngineError> {
        self.db.with_tx(|tx| {
            let job = job_repo::get(tx, job_id)?;
            if matches!(job.status, JobStatus::InProgress | JobStatus::Completed) {
                log::debug!("Job {} is {}; run is a no-op", job_id, job.status);
                return Ok(RunOutcome::Unchanged(job.status));
            }

            ensure_runnable(&job)?;

            let invalidated = unit_repo::invalidate_for_job(tx, job_id)?;
            job_repo::set_status(tx, job_id, JobStatus::InProgress)?;

            log::info!(
                "Job {} started ({} previous units invalidated)",
                job_id,
                invalidated
            );
            Ok(RunOutcome::Started)
        })
    }

    /// Queues a job for a run.
    ///
    /// Units from a previous run are invalidated here so the next status
    /// read cannot roll the job straight back to its old outcome.
    pub fn submit(&self, job_id: i64) -> Result<JobStatus, EngineError> {
        let status = self.db.with_tx(|tx| {
            let job = job_repo::get(tx, job_id)?;
            ensure_runnable(&job)?;
            job.configs.validate()?;

            let status = job_repo::set_status(tx, job_id, JobStatus::Pending)?;
            unit_repo::invalidate_for_job(tx, job_id)?;
            Ok::<_, EngineError>(status)
        })?;

        self.queue.enqueue(QueueTask::RunJob { job_id }, self.retry)?;
        log::info!("Job {} submitted", job_id);
        Ok(status)
    }

    /// Loads the job with its status rolled up from its units.
    pub fn refresh(&self, job_id: i64) -> Result<(JobRecord, UnitCounts), EngineError> {
        let refreshed = self.db.with_tx(|tx| rollup(tx, job_id))?;
        Ok(refreshed)
    }

    /// Moves the job to FAILED if it is in a state that can fail.
    pub fn mark_failed(&self, job_id: i64) -> Result<(), EngineError> {
        self.db.with_tx(|tx| {
            let Some(job) = job_repo::find_by_id(tx, job_id)? else {
                return Ok(());
            };
            if job.status != JobStatus::Failed && job.status.can_transition_to(JobStatus::Failed)
            {
                job_repo::set_status(tx, job_id, JobStatus::Failed)?;
                log::warn!("Job {} marked FAILED", job_id);
            }
            Ok::<_, EngineError>(())
        })
    }
}

fn ensure_runnable(job: &JobRecord) -> Result<(), EngineError> {
    if job.configs.prompt().is_none() {
        return Err(EngineError::MissingConfiguration {
            job_id: job.id,
            field: "prompt",
        });
    }
    if job.file_path.is_none() {
        return Err(EngineError::NoFileAttached(job.id));
    }
    Ok(())
}

/// Recomputes a PENDING or IN_PROGRESS job's status from its valid units.
///
/// Jobs without valid units, or with units still outstanding, keep their
/// status. Returns the job as stored afterwards together with the counts.
pub(crate) fn rollup(
    conn: &Connection,
    job_id: i64,
) -> Result<(JobRecord, UnitCounts), DatabaseError> {
    let mut job = job_repo::get(conn, job_id)?;
    let counts = unit_repo::counts_for_job(conn, job_id)?;

    if matches!(job.status, JobStatus::Pending | JobStatus::InProgress) {
        if let Some(target) = counts.rollup() {
            if target != job.status {
                job.status = job_repo::set_status(conn, job_id, target)?;
                log::info!("Job {} rolled up to {}", job_id, target);
            }
        }
    }

    Ok((job, counts))
}
