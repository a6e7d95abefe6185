//! Job and task-unit state machines.
//!
//! Both machines are closed tables of allowed `(from, to)` pairs. A rejected
//! transition returns [`InvalidTransition`] and leaves the caller's value
//! untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected state change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {entity} status transition from {from} to {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

/// Unrecognized status string read from storage or input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown status '{0}'")]
pub struct UnknownStatus(pub String);

/// Lifecycle of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Uploaded,
    Configured,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Created,
        JobStatus::Uploaded,
        JobStatus::Configured,
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Targets reachable from this state.
    pub fn allowed_targets(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Created => &[Uploaded],
            Uploaded => &[Uploaded, Configured],
            Configured => &[Uploaded, Configured, Pending, InProgress],
            Pending => &[Pending, InProgress, Completed, Failed],
            InProgress => &[InProgress, Completed, Failed],
            Completed => &[Completed, Configured, Pending, InProgress],
            Failed => &[Failed, Pending, InProgress],
        }
    }

    pub fn can_transition_to(self, target: JobStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Validates `self -> target` and returns the new state.
    pub fn transition(self, target: JobStatus) -> Result<JobStatus, InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            log::error!("Invalid job status transition from {} to {}", self, target);
            Err(InvalidTransition {
                entity: "job",
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Uploaded => "UPLOADED",
            JobStatus::Configured => "CONFIGURED",
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Lifecycle of a single task unit (and of each recorded response).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl UnitStatus {
    pub const ALL: [UnitStatus; 4] = [
        UnitStatus::Pending,
        UnitStatus::InProgress,
        UnitStatus::Completed,
        UnitStatus::Failed,
    ];

    pub fn allowed_targets(self) -> &'static [UnitStatus] {
        use UnitStatus::*;
        match self {
            Pending => &[Pending, InProgress, Failed],
            InProgress => &[InProgress, Completed, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, target: UnitStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn transition(self, target: UnitStatus) -> Result<UnitStatus, InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            log::error!("Invalid unit status transition from {} to {}", self, target);
            Err(InvalidTransition {
                entity: "task unit",
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "PENDING",
            UnitStatus::InProgress => "IN_PROGRESS",
            UnitStatus::Completed => "COMPLETED",
            UnitStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnitStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Per-status unit tally for one job (valid units only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl UnitCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed
    }

    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_progress
    }

    pub fn add(&mut self, status: UnitStatus, count: u64) {
        match status {
            UnitStatus::Pending => self.pending += count,
            UnitStatus::InProgress => self.in_progress += count,
            UnitStatus::Completed => self.completed += count,
            UnitStatus::Failed => self.failed += count,
        }
    }

    /// Job status implied by these counts, or `None` while work is outstanding
    /// or no units exist.
    pub fn rollup(&self) -> Option<JobStatus> {
        if self.total() == 0 || self.outstanding() > 0 {
            None
        } else if self.failed > 0 {
            Some(JobStatus::Failed)
        } else {
            Some(JobStatus::Completed)
        }
    }
}
