//! Turns a job's file into task units and queues them for execution.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::db::job_repo;
use crate::db::unit_repo::{self, AttachmentRecord, UnitDraft, UnitRef};
use crate::db::Database;
use crate::error::EngineError;
use crate::job::JobStatus;
use crate::prompt;
use crate::splitter::{ContentBlock, DocumentSplitter, SplitOptions};
use crate::worker::{EnqueueOptions, JobQueue, QueueTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Units were persisted and enqueued. A dispatch that finds nothing to
    /// run completes the job.
    Dispatched { units: usize },
    /// Another dispatch holds the job.
    Busy,
    /// The job is no longer running; nothing to do.
    Skipped(JobStatus),
}

pub struct Dispatcher {
    db: Database,
    queue: Arc<dyn JobQueue>,
    splitter: Arc<dyn DocumentSplitter>,
    job_lease: Duration,
    pdf_dpi: u32,
    unit_retry: EnqueueOptions,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        queue: Arc<dyn JobQueue>,
        splitter: Arc<dyn DocumentSplitter>,
        job_lease: Duration,
        pdf_dpi: u32,
        unit_retry: EnqueueOptions,
    ) -> Self {
        Self {
            db,
            queue,
            splitter,
            job_lease,
            pdf_dpi,
            unit_retry,
        }
    }

    /// Splits the job's file, upserts one unit per non-blank block and then
    /// enqueues every unit.
    ///
    /// A FAILED job (a retried dispatch) is moved back to IN_PROGRESS first.
    /// Jobs in any other state than IN_PROGRESS are skipped.
    pub fn dispatch(&self, job_id: i64) -> Result<DispatchOutcome, EngineError> {
        let _span = tracing::info_span!("engine.dispatch", job_id).entered();

        let owner = super::lease_owner();
        let acquired = self.db.with_conn(|conn| {
            job_repo::get(conn, job_id)?;
            job_repo::try_acquire_lease(conn, job_id, &owner, self.job_lease)
        })?;
        if !acquired {
            log::info!("Job {} is held by another worker; dispatch skipped", job_id);
            return Ok(DispatchOutcome::Busy);
        }

        let outcome = self.dispatch_leased(job_id);

        if let Err(e) = self
            .db
            .with_conn(|conn| job_repo::release_lease(conn, job_id, &owner))
        {
            log::warn!("Failed to release lease on job {}: {}", job_id, e);
        }

        outcome
    }

    fn dispatch_leased(&self, job_id: i64) -> Result<DispatchOutcome, EngineError> {
        let job = self.db.with_tx(|tx| {
            let mut job = job_repo::get(tx, job_id)?;
            if job.status == JobStatus::Failed {
                job.status = job_repo::set_status(tx, job_id, JobStatus::InProgress)?;
                log::info!("Retrying dispatch of job {}", job_id);
            }
            Ok::<_, EngineError>(job)
        })?;

        if job.status != JobStatus::InProgress {
            log::info!("Job {} is {}; dispatch skipped", job_id, job.status);
            return Ok(DispatchOutcome::Skipped(job.status));
        }

        let template = job
            .configs
            .prompt()
            .ok_or(EngineError::MissingConfiguration {
                job_id,
                field: "prompt",
            })?;
        let file_path = job
            .file_path
            .as_deref()
            .ok_or(EngineError::NoFileAttached(job_id))?;

        let options = SplitOptions::from_config(&job.configs, self.pdf_dpi);
        let blocks = self.splitter.split(Path::new(file_path), &options)?;

        // Every block is rendered before anything is written, and the pass is
        // persisted in one transaction: a failed dispatch leaves no units.
        let mut drafts: Vec<UnitDraft> = Vec::new();
        let mut skipped = 0usize;

        for block in blocks {
            let block = block?;
            let Some(content) = render_block(template, &block)? else {
                skipped += 1;
                continue;
            };

            drafts.push(UnitDraft {
                unit_index: (drafts.len() + 1) as u32,
                content,
                attachments: block
                    .attachments
                    .iter()
                    .map(|a| AttachmentRecord {
                        media_type: a.media_type.clone(),
                        data_base64: a.to_base64(),
                    })
                    .collect(),
            });
        }

        let units = self.persist(job_id, &drafts)?;

        log::info!(
            "Job {} split into {} units ({} blank blocks skipped)",
            job_id,
            units.len(),
            skipped
        );

        if units.is_empty() {
            // Nothing to execute, so nothing would ever roll the job up.
            self.db
                .with_conn(|conn| job_repo::set_status(conn, job_id, JobStatus::Completed))?;
            return Ok(DispatchOutcome::Dispatched { units: 0 });
        }

        for unit in &units {
            if let Err(e) = self.queue.enqueue(
                QueueTask::ExecuteUnit {
                    unit_id: unit.id,
                    generation: unit.generation,
                },
                self.unit_retry,
            ) {
                if let Err(db_err) = self
                    .db
                    .with_conn(|conn| unit_repo::invalidate_for_job(conn, job_id))
                {
                    log::warn!("Failed to invalidate units of job {}: {}", job_id, db_err);
                }
                return Err(e.into());
            }
        }

        Ok(DispatchOutcome::Dispatched { units: units.len() })
    }

    fn persist(&self, job_id: i64, drafts: &[UnitDraft]) -> Result<Vec<UnitRef>, EngineError> {
        self.db.with_tx(|tx| {
            let mut refs = Vec::with_capacity(drafts.len());
            for draft in drafts {
                refs.push(unit_repo::upsert(tx, job_id, draft)?);
            }
            Ok(refs)
        })
    }
}

/// Renders the unit content for a block, or `None` when the block has
/// nothing to send.
fn render_block(template: &str, block: &ContentBlock) -> Result<Option<String>, EngineError> {
    if block.is_blank() {
        return Ok(None);
    }
    let content = prompt::render(template, &block.fields)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(content))
}
