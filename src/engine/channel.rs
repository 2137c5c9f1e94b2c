use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ChannelError, ErrorKind};
use crate::notification::{Channel, Notification};

/// Per-attempt context handed to an adapter alongside the notification.
/// `delivery_id` is stable across every attempt of one logical delivery so
/// adapters can deduplicate redelivered work.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext {
    pub delivery_id: Uuid,
    /// 1-based attempt number on this channel.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AttemptContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome of a single (channel, attempt) pair. The orchestrator returns
/// one of these per attempt it made, successes and failures alike.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub notification_id: Uuid,
    pub channel: Channel,
    pub attempt: u32,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub latency: Duration,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Set when this attempt was part of the fallback round rather than a
    /// requested channel.
    pub fallback: bool,
}

impl DeliveryResult {
    pub fn ok(
        notification_id: Uuid,
        channel: Channel,
        attempt: u32,
        latency: Duration,
    ) -> Self {
        Self {
            notification_id,
            channel,
            attempt,
            success: true,
            timestamp: Utc::now(),
            latency,
            error: None,
            error_kind: None,
            fallback: false,
        }
    }

    pub fn failed(
        notification_id: Uuid,
        channel: Channel,
        attempt: u32,
        latency: Duration,
        error: &ChannelError,
    ) -> Self {
        Self {
            notification_id,
            channel,
            attempt,
            success: false,
            timestamp: Utc::now(),
            latency,
            error: Some(error.message.clone()),
            error_kind: Some(error.kind),
            fallback: false,
        }
    }
}

/// Contract between the orchestrator and a delivery medium.
///
/// Adapters must tolerate redelivery of the same notification (the engine
/// guarantees at-least-once, not exactly-once) and classify failures via
/// [`ErrorKind`] so the retry loop knows what is worth repeating.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn channel(&self) -> Channel;

    /// One-time setup (connection pools, auth). Called before the engine
    /// starts ticking.
    async fn initialize(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Deliver one notification. A clean return means the provider
    /// accepted the message; it does not imply the user saw it.
    async fn deliver(
        &self,
        notification: &Notification,
        ctx: &AttemptContext,
    ) -> Result<(), ChannelError>;

    /// Flush and release resources. Called once during engine shutdown,
    /// after in-flight deliveries have drained.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_attempt_detection() {
        let ctx = AttemptContext {
            delivery_id: Uuid::now_v7(),
            attempt: 3,
            max_attempts: 3,
        };
        assert!(ctx.is_last_attempt());
        let ctx = AttemptContext { attempt: 1, ..ctx };
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn failed_result_carries_classification() {
        let err = ChannelError::new(Channel::Sms, ErrorKind::InvalidTarget, "no phone number");
        let result = DeliveryResult::failed(
            Uuid::now_v7(),
            Channel::Sms,
            1,
            Duration::from_millis(12),
            &err,
        );
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidTarget));
        assert_eq!(result.error.as_deref(), Some("no phone number"));
    }
}
