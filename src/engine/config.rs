use serde::Deserialize;

use crate::notification::{Channel, Priority};

/// Top-level engine configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: TickConfig,
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub admission: AdmissionConfig,
}

/// Tick loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Interval between queue drains.
    pub tick_interval_ms: u64,
    /// Max entries dequeued per tick.
    pub batch_size: usize,
    /// Upper bound on deliveries in flight at once across all ticks.
    pub max_concurrent_deliveries: usize,
    /// Full delivery cycles that ended in failure before a notification is
    /// marked failed for good. 0 disables re-queueing.
    pub max_redeliveries: u32,
}

/// Priority queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard capacity across all priority tiers. Enqueues past this are
    /// rejected so callers see back-pressure instead of unbounded growth.
    pub max_size: usize,
}

/// Per-priority delivery attempt ceilings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriorityAttempts {
    pub critical: u32,
    pub urgent: u32,
    pub high: u32,
    pub normal: u32,
    pub low: u32,
}

impl PriorityAttempts {
    pub fn for_priority(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical,
            Priority::Urgent => self.urgent,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

/// Orchestrator configuration (retries, timeouts, fallback).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// First-retry delay; doubles per attempt up to `max_backoff_ms`.
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Wall-clock limit for a single adapter call.
    pub attempt_timeout_ms: u64,
    pub attempts: PriorityAttempts,
    /// When every primary channel fails, try these channels (minus any
    /// already attempted) once each.
    pub enable_fallback: bool,
    pub fallback_channels: Vec<Channel>,
}

/// Admission filter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub enabled: bool,
    /// Relevance score below which a notification is declined.
    pub confidence_threshold: f64,
    /// Spam score at or above which a notification is declined regardless
    /// of priority.
    pub spam_block_threshold: f64,
    pub max_per_hour: u32,
    pub max_per_day: u32,
    /// Per-kind hourly ceilings keyed by the kind's snake_case name,
    /// overriding the built-in defaults.
    pub kind_max_per_hour: std::collections::HashMap<String, u32>,
    /// Recent-content memory used for duplicate detection.
    pub duplicate_window_secs: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            batch_size: 10,
            max_concurrent_deliveries: 64,
            max_redeliveries: 2,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_size: 10_000 }
    }
}

impl Default for PriorityAttempts {
    fn default() -> Self {
        Self {
            critical: 5,
            urgent: 4,
            high: 3,
            normal: 2,
            low: 1,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            attempt_timeout_ms: 10_000,
            attempts: PriorityAttempts::default(),
            enable_fallback: true,
            fallback_channels: vec![Channel::Socket, Channel::InApp],
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.3,
            spam_block_threshold: 0.8,
            max_per_hour: 20,
            max_per_day: 100,
            kind_max_per_hour: std::collections::HashMap::new(),
            duplicate_window_secs: 86_400,
        }
    }
}
