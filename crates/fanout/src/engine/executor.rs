//! Runs one task unit against the completion API and records the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broadcast::{NotificationChannel, UnitNotification};
use crate::completion::{CompletionClient, CompletionError, CompletionRequest, ContentPart};
use crate::db::response_repo::{self, NewResponse};
use crate::db::unit_repo::{self, UnitRecord};
use crate::db::Database;
use crate::error::EngineError;
use crate::job::UnitStatus;

use super::cache::JobCache;

/// Why an execution did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker holds the unit lease.
    Leased,
    Missing,
    /// The unit was invalidated or re-created after this task was enqueued.
    Stale,
    /// The unit already reached COMPLETED or FAILED.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Completed,
    /// The attempt failed. When `final_attempt` is false the unit stays
    /// IN_PROGRESS and should be retried.
    Failed {
        error: CompletionError,
        final_attempt: bool,
    },
    Skipped(SkipReason),
}

/// Settings the executor takes from the engine configuration.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_model: String,
    pub max_tokens: u32,
    pub unit_lease: Duration,
}

pub struct Executor {
    db: Database,
    jobs: JobCache,
    client: Arc<dyn CompletionClient>,
    notifier: Arc<dyn NotificationChannel>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        db: Database,
        jobs: JobCache,
        client: Arc<dyn CompletionClient>,
        notifier: Arc<dyn NotificationChannel>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            db,
            jobs,
            client,
            notifier,
            settings,
        }
    }

    /// Executes `unit_id` if it is still at `generation`.
    ///
    /// `attempt` is zero-based. On the final attempt a failure is permanent.
    pub fn execute(
        &self,
        unit_id: i64,
        generation: i64,
        attempt: u32,
        final_attempt: bool,
    ) -> Result<ExecuteOutcome, EngineError> {
        let _span = tracing::info_span!("engine.execute", unit_id, generation, attempt).entered();

        if self
            .db
            .with_conn(|conn| unit_repo::find_by_id(conn, unit_id))?
            .is_none()
        {
            log::debug!("Unit {} no longer exists; skipping", unit_id);
            return Ok(ExecuteOutcome::Skipped(SkipReason::Missing));
        }

        let owner = super::lease_owner();
        let acquired = self.db.with_conn(|conn| {
            unit_repo::try_acquire_lease(conn, unit_id, &owner, self.settings.unit_lease)
        })?;
        if !acquired {
            log::debug!("Unit {} is leased elsewhere; skipping", unit_id);
            self.publish_current(unit_id);
            return Ok(ExecuteOutcome::Skipped(SkipReason::Leased));
        }

        let outcome = self.execute_leased(unit_id, generation, attempt, final_attempt);

        if let Err(e) = self
            .db
            .with_conn(|conn| unit_repo::release_lease(conn, unit_id, &owner))
        {
            log::warn!("Failed to release lease on unit {}: {}", unit_id, e);
        }

        if let Ok(ExecuteOutcome::Skipped(_)) = &outcome {
            self.publish_current(unit_id);
        }

        outcome
    }

    /// Publishes the stored status of a unit whose execution recorded nothing.
    fn publish_current(&self, unit_id: i64) {
        match self
            .db
            .with_conn(|conn| unit_repo::find_by_id(conn, unit_id))
        {
            Ok(Some(unit)) => self.notifier.publish(UnitNotification::new(
                unit.job_id,
                unit.id,
                unit.unit_index,
                unit.status,
                None,
            )),
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load unit {} for notification: {}", unit_id, e),
        }
    }

    fn execute_leased(
        &self,
        unit_id: i64,
        generation: i64,
        attempt: u32,
        final_attempt: bool,
    ) -> Result<ExecuteOutcome, EngineError> {
        let Some(unit) = self
            .db
            .with_conn(|conn| unit_repo::find_by_id(conn, unit_id))?
        else {
            return Ok(ExecuteOutcome::Skipped(SkipReason::Missing));
        };
        if !unit.is_valid || unit.generation != generation {
            log::debug!("Unit {} is stale (generation {})", unit_id, generation);
            return Ok(ExecuteOutcome::Skipped(SkipReason::Stale));
        }
        if unit.status.is_terminal() {
            return Ok(ExecuteOutcome::Skipped(SkipReason::Finished));
        }

        let job = self.jobs.get(unit.job_id)?;

        // Committed before the call so readers see the unit as running.
        if unit.status == UnitStatus::Pending {
            let current = self.db.with_tx(|tx| {
                if !unit_repo::is_current(tx, unit_id, generation)? {
                    return Ok::<_, EngineError>(false);
                }
                unit_repo::set_status(tx, unit_id, UnitStatus::InProgress)?;
                Ok(true)
            })?;
            if !current {
                return Ok(ExecuteOutcome::Skipped(SkipReason::Stale));
            }
        }

        let model = job.configs.model_or(&self.settings.default_model);
        let started = Instant::now();
        let (request_data, result) = match self.build_request(&unit, model) {
            Ok(request) => {
                let result = self.client.complete(&request);
                (Some(request.echo()), result)
            }
            Err(e) => {
                log::error!("Failed to build request for unit {}: {}", unit_id, e);
                (None, Err(CompletionError::Request(e.to_string())))
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        let mut response = NewResponse {
            job_id: unit.job_id,
            unit_id,
            unit_index: unit.unit_index,
            request_data,
            response_data: None,
            status: UnitStatus::Completed,
            error_message: None,
            processing_time: Some(elapsed),
            attempt: attempt + 1,
        };

        let (outcome, summary) = match result {
            Ok(completion) => {
                response.response_data = Some(completion.normalized());
                (ExecuteOutcome::Completed, completion.text)
            }
            Err(error) => {
                log::warn!(
                    "Unit {} attempt {} failed: {}",
                    unit_id,
                    attempt + 1,
                    error
                );
                response.status = UnitStatus::Failed;
                response.error_message = Some(error.to_string());
                let summary = error.to_string();
                (
                    ExecuteOutcome::Failed {
                        error,
                        final_attempt,
                    },
                    summary,
                )
            }
        };

        let recorded = self.db.with_tx(|tx| {
            if !unit_repo::is_current(tx, unit_id, generation)? {
                return Ok::<_, EngineError>(false);
            }
            let response_id = response_repo::insert(tx, &response)?;
            unit_repo::set_latest_response(tx, unit_id, response_id)?;
            match &outcome {
                ExecuteOutcome::Completed => {
                    unit_repo::set_status(tx, unit_id, UnitStatus::Completed)?;
                }
                ExecuteOutcome::Failed {
                    final_attempt: true,
                    ..
                } => {
                    unit_repo::set_status(tx, unit_id, UnitStatus::Failed)?;
                }
                _ => {}
            }
            Ok(true)
        })?;

        if !recorded {
            log::info!("Unit {} was invalidated during execution; result dropped", unit_id);
            return Ok(ExecuteOutcome::Skipped(SkipReason::Stale));
        }

        self.notifier.publish(UnitNotification::new(
            unit.job_id,
            unit_id,
            unit.unit_index,
            response.status,
            Some(summary),
        ));

        log::debug!("Unit {} recorded as {}", unit_id, response.status);
        Ok(outcome)
    }

    fn build_request(&self, unit: &UnitRecord, model: &str) -> Result<CompletionRequest, EngineError> {
        let mut parts = vec![ContentPart::Text(unit.content.clone())];
        if unit.has_content_blocks {
            let attachments = self
                .db
                .with_conn(|conn| unit_repo::attachments(conn, unit.id))?;
            parts.extend(attachments.into_iter().map(|a| ContentPart::Image {
                media_type: a.media_type,
                data_base64: a.data_base64,
            }));
        }

        Ok(CompletionRequest {
            model: model.to_string(),
            parts,
            max_tokens: self.settings.max_tokens,
        })
    }
}
