//! Broadcast channel for unit progress notifications.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::{NotificationChannel, UnitNotification};

/// Fans unit notifications out to every subscriber.
///
/// Subscribers that fall more than `capacity` events behind lose the oldest
/// ones (`RecvError::Lagged`).
#[derive(Clone)]
pub struct UnitProgressBroadcaster {
    sender: Arc<broadcast::Sender<UnitNotification>>,
}

impl UnitProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnitNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UnitProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationChannel for UnitProgressBroadcaster {
    fn publish(&self, notification: UnitNotification) {
        // No active receivers is fine.
        let _ = self.sender.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::UnitStatus;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = UnitProgressBroadcaster::new(4);
        broadcaster.publish(UnitNotification::new(1, 2, 1, UnitStatus::Completed, None));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_receive_notifications() {
        let broadcaster = UnitProgressBroadcaster::new(4);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        broadcaster.publish(UnitNotification::new(
            7,
            11,
            3,
            UnitStatus::Failed,
            Some("timeout".to_string()),
        ));

        for rx in [&mut first, &mut second] {
            let received = rx.try_recv().unwrap();
            assert_eq!(received.job_id, 7);
            assert_eq!(received.unit_id, 11);
            assert_eq!(received.status, UnitStatus::Failed);
            assert_eq!(received.summary.as_deref(), Some("timeout"));
        }
        assert!(matches!(first.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_lagging_subscriber_drops_oldest() {
        let broadcaster = UnitProgressBroadcaster::new(2);
        let mut rx = broadcaster.subscribe();
        for unit_id in 0..4 {
            broadcaster.publish(UnitNotification::new(1, unit_id, 1, UnitStatus::Completed, None));
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(2))));
        assert_eq!(rx.try_recv().unwrap().unit_id, 2);
    }

    #[test]
    fn test_serializes_camel_case() {
        let event = UnitNotification::new(1, 2, 3, UnitStatus::InProgress, None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["jobId"], 1);
        assert_eq!(json["unitIndex"], 3);
        assert_eq!(json["status"], "IN_PROGRESS");
        assert!(json.get("summary").is_none());
    }
}
