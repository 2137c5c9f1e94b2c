use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

use crate::notification::{Channel, Priority};

/// Core OTel metrics for the engine. Created once at engine construction;
/// instruments are no-op when no meter provider is installed.
pub struct Metrics {
    pub notifications_created: Counter<u64>,
    pub notifications_delivered: Counter<u64>,
    pub notifications_failed: Counter<u64>,
    pub notifications_blocked: Counter<u64>,
    pub notifications_expired: Counter<u64>,
    pub delivery_attempts: Counter<u64>,
    pub fallback_rounds: Counter<u64>,
    pub queue_depth: Gauge<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create metrics from the global meter provider.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("aviso");
        Self::from_meter(&meter)
    }

    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            notifications_created: meter
                .u64_counter("aviso.notifications.created")
                .with_description("Notifications accepted by create")
                .build(),
            notifications_delivered: meter
                .u64_counter("aviso.notifications.delivered")
                .with_description("Notifications with every channel delivered")
                .build(),
            notifications_failed: meter
                .u64_counter("aviso.notifications.failed")
                .with_description("Notifications with every channel failed")
                .build(),
            notifications_blocked: meter
                .u64_counter("aviso.notifications.blocked")
                .with_description("Notifications declined by admission control")
                .build(),
            notifications_expired: meter
                .u64_counter("aviso.notifications.expired")
                .with_description("Notifications dropped past their expiry")
                .build(),
            delivery_attempts: meter
                .u64_counter("aviso.delivery.attempts")
                .with_description("Adapter delivery attempts, per channel and outcome")
                .build(),
            fallback_rounds: meter
                .u64_counter("aviso.delivery.fallback_rounds")
                .with_description("Deliveries that entered the fallback round")
                .build(),
            queue_depth: meter
                .u64_gauge("aviso.queue.depth")
                .with_description("Queued plus scheduled notifications")
                .build(),
        }
    }

    pub fn record_created(&self, priority: Priority) {
        self.notifications_created
            .add(1, &[KeyValue::new("priority", priority.weight() as i64)]);
    }

    pub fn record_delivered(&self) {
        self.notifications_delivered.add(1, &[]);
    }

    pub fn record_failed(&self) {
        self.notifications_failed.add(1, &[]);
    }

    pub fn record_blocked(&self, reason: &str) {
        self.notifications_blocked
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_expired(&self) {
        self.notifications_expired.add(1, &[]);
    }

    pub fn record_attempt(&self, channel: Channel, success: bool) {
        self.delivery_attempts.add(
            1,
            &[
                KeyValue::new("channel", channel.to_string()),
                KeyValue::new("success", success),
            ],
        );
    }

    pub fn record_fallback_round(&self) {
        self.fallback_rounds.add(1, &[]);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.record(depth, &[]);
    }
}
