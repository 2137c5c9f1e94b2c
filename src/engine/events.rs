use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Lifecycle transitions observable from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Sent,
    Delivered,
    Failed,
    Blocked,
    Expired,
    Read,
    Clicked,
}

/// One lifecycle event. `data` carries kind-specific detail (block reason,
/// failing channels) as loose JSON so subscribers stay decoupled from
/// engine internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub notification_id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
}

impl NotificationEvent {
    pub fn new(kind: EventKind, notification_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            kind,
            notification_id,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Bounded fan-out of lifecycle events.
///
/// Each subscriber gets its own bounded channel. Publishing never blocks
/// the delivery loop: a full subscriber drops that event (logged), a
/// closed subscriber is unregistered on the next publish.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<NotificationEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<NotificationEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: NotificationEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    kind = ?event.kind,
                    notification_id = %event.notification_id,
                    "subscriber channel full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
