//! Job and task-unit domain types.

pub mod config;
pub mod status;

pub use config::{DocumentMode, InvalidJobConfig, JobConfig};
pub use status::{InvalidTransition, JobStatus, UnitCounts, UnitStatus, UnknownStatus};
