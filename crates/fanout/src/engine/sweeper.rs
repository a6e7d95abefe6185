//! Periodic recovery of work lost to crashes, restarts or dropped queue
//! messages.
//!
//! A sweep runs under the named store lock [`SWEEP_LOCK`], so at most one
//! process sweeps at a time. Each recovered item is handled on its own; a
//! failure is logged and the sweep moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Notify};

use crate::config::SweeperConfig;
use crate::db::{format_timestamp, job_repo, lock_repo, unit_repo, Database};
use crate::error::{EngineError, WorkerError};
use crate::job::JobStatus;
use crate::worker::{EnqueueOptions, JobQueue, QueueTask};

use super::supervisor;

pub const SWEEP_LOCK: &str = "recovery-sweep";

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs_rerun: usize,
    pub jobs_rolled_up: usize,
    pub jobs_redispatched: usize,
    pub units_requeued: usize,
    pub stalled_units_requeued: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.jobs_rerun
            + self.jobs_rolled_up
            + self.jobs_redispatched
            + self.units_requeued
            + self.stalled_units_requeued
    }
}

pub struct RecoverySweeper {
    db: Database,
    queue: Arc<dyn JobQueue>,
    config: SweeperConfig,
    retry: EnqueueOptions,
}

impl RecoverySweeper {
    pub fn new(
        db: Database,
        queue: Arc<dyn JobQueue>,
        config: SweeperConfig,
        retry: EnqueueOptions,
    ) -> Self {
        Self {
            db,
            queue,
            config,
            retry,
        }
    }

    /// Runs one sweep. Returns `None` when another process holds the sweep
    /// lock.
    pub fn sweep(&self) -> Result<Option<SweepReport>, EngineError> {
        let owner = super::lease_owner();
        let acquired = self.db.with_conn(|conn| {
            lock_repo::try_acquire(conn, SWEEP_LOCK, &owner, self.config.lock_ttl())
        })?;
        if !acquired {
            log::debug!("Recovery sweep already running elsewhere");
            return Ok(None);
        }

        let report = self.sweep_locked();

        if let Err(e) = self
            .db
            .with_conn(|conn| lock_repo::release(conn, SWEEP_LOCK, &owner))
        {
            log::warn!("Failed to release sweep lock: {}", e);
        }

        if report.total() > 0 || report.failures > 0 {
            log::info!("Recovery sweep: {:?}", report);
        }
        Ok(Some(report))
    }

    fn sweep_locked(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();
        let limit = self.config.batch_limit;
        let pending_cutoff = format_timestamp(now - self.config.pending_grace());
        let stale_cutoff = format_timestamp(now - self.config.stale_after());

        // Jobs whose run message never arrived, or whose units all finished
        // without anybody reading the status.
        match self.db.with_conn(|conn| {
            job_repo::list_ids_by_status(conn, JobStatus::Pending, &pending_cutoff, limit)
        }) {
            Ok(ids) => {
                for job_id in ids {
                    match self.recover_pending_job(job_id) {
                        Ok(PendingRecovery::Rerun) => report.jobs_rerun += 1,
                        Ok(PendingRecovery::RolledUp) => report.jobs_rolled_up += 1,
                        Err(e) => {
                            log::warn!("Failed to recover pending job {}: {}", job_id, e);
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to list pending jobs: {}", e);
                report.failures += 1;
            }
        }

        match self
            .db
            .with_conn(|conn| unit_repo::list_pending_before(conn, &pending_cutoff, limit))
        {
            Ok(units) => {
                for unit in units {
                    match self.requeue_unit(unit.id, unit.generation) {
                        Ok(()) => report.units_requeued += 1,
                        Err(e) => {
                            log::warn!("Failed to requeue unit {}: {}", unit.id, e);
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to list pending units: {}", e);
                report.failures += 1;
            }
        }

        match self
            .db
            .with_conn(|conn| unit_repo::list_stalled_before(conn, &stale_cutoff, limit))
        {
            Ok(units) => {
                for unit in units {
                    match self.requeue_unit(unit.id, unit.generation) {
                        Ok(()) => report.stalled_units_requeued += 1,
                        Err(e) => {
                            log::warn!("Failed to requeue stalled unit {}: {}", unit.id, e);
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to list stalled units: {}", e);
                report.failures += 1;
            }
        }

        match self.db.with_conn(|conn| {
            job_repo::list_settled_running(conn, &stale_cutoff, limit)
        }) {
            Ok(ids) => {
                for job_id in ids {
                    match self.recover_running_job(job_id) {
                        Ok(Some(RunningRecovery::Redispatched)) => report.jobs_redispatched += 1,
                        Ok(Some(RunningRecovery::RolledUp)) => report.jobs_rolled_up += 1,
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("Failed to recover running job {}: {}", job_id, e);
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to list running jobs: {}", e);
                report.failures += 1;
            }
        }

        report
    }

    fn recover_pending_job(&self, job_id: i64) -> Result<PendingRecovery, EngineError> {
        let counts = self
            .db
            .with_conn(|conn| unit_repo::counts_for_job(conn, job_id))?;
        if counts.total() == 0 || counts.outstanding() > 0 {
            self.queue
                .enqueue(QueueTask::RunJob { job_id }, self.retry)?;
            return Ok(PendingRecovery::Rerun);
        }

        self.db
            .with_tx(|tx| supervisor::rollup(tx, job_id).map(|_| ()))?;
        Ok(PendingRecovery::RolledUp)
    }

    /// Picks up a running job that was abandoned mid-dispatch (no valid
    /// units) or whose units all finished.
    fn recover_running_job(&self, job_id: i64) -> Result<Option<RunningRecovery>, EngineError> {
        let counts = self
            .db
            .with_conn(|conn| unit_repo::counts_for_job(conn, job_id))?;
        if counts.total() == 0 {
            self.queue
                .enqueue(QueueTask::DispatchJob { job_id }, self.retry)?;
            return Ok(Some(RunningRecovery::Redispatched));
        }
        if counts.outstanding() == 0 {
            self.db
                .with_tx(|tx| supervisor::rollup(tx, job_id).map(|_| ()))?;
            return Ok(Some(RunningRecovery::RolledUp));
        }
        Ok(None)
    }

    fn requeue_unit(&self, unit_id: i64, generation: i64) -> Result<(), WorkerError> {
        self.queue.enqueue(
            QueueTask::ExecuteUnit {
                unit_id,
                generation,
            },
            self.retry,
        )
    }
}

enum PendingRecovery {
    Rerun,
    RolledUp,
}

enum RunningRecovery {
    Redispatched,
    RolledUp,
}

/// Enqueues a sweep task on a fixed interval from a background thread.
pub struct RecoveryScheduler {
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl RecoveryScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Starts the timer thread. A message on `trigger_rx` requests an
    /// immediate sweep.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> Result<JoinHandle<()>, WorkerError> {
        let queue = Arc::clone(&self.queue);
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let interval = self.interval;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        std::thread::Builder::new()
            .name("fanout-sweeper".to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let mut timer = tokio::time::interval(interval);
                    timer.tick().await; // skip immediate first tick

                    loop {
                        tokio::select! {
                            _ = timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::info!("Manual recovery sweep triggered");
                            },
                            _ = wake.notified() => {},
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        if let Err(e) = queue.enqueue(QueueTask::Sweep, EnqueueOptions::NO_RETRY) {
                            log::error!("Failed to enqueue recovery sweep: {}", e);
                        }
                    }
                });
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}
