//! Real-time notification of task unit progress.

pub mod unit_progress;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::UnitStatus;

pub use unit_progress::UnitProgressBroadcaster;

/// Published after every recorded unit outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitNotification {
    pub job_id: i64,
    pub unit_id: i64,
    pub unit_index: u32,
    pub status: UnitStatus,
    /// Model output on success, error text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UnitNotification {
    pub fn new(
        job_id: i64,
        unit_id: i64,
        unit_index: u32,
        status: UnitStatus,
        summary: Option<String>,
    ) -> Self {
        Self {
            job_id,
            unit_id,
            unit_index,
            status,
            summary,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget publisher. Delivery is at most once; a missing or slow
/// subscriber never blocks or fails the publisher.
pub trait NotificationChannel: Send + Sync {
    fn publish(&self, notification: UnitNotification);
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl NotificationChannel for NoopNotifier {
    fn publish(&self, _notification: UnitNotification) {}
}
