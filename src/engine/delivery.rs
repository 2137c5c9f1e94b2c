use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::channel::{AttemptContext, ChannelAdapter, DeliveryResult};
use crate::engine::config::DeliveryConfig;
use crate::engine::metrics::Metrics;
use crate::error::{ChannelError, ErrorKind};
use crate::notification::{Channel, Notification, Priority};

/// Retry schedule for one channel of one delivery. Derived from the
/// per-priority attempt table: higher priority gets more attempts and a
/// tighter delay ceiling, so critical work retries fast and often.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn for_priority(config: &DeliveryConfig, priority: Priority) -> Self {
        let cap_divisor = match priority {
            Priority::Critical => 8,
            Priority::Urgent => 4,
            Priority::High => 2,
            Priority::Normal | Priority::Low => 1,
        };
        Self {
            max_attempts: config.attempts.for_priority(priority).max(1),
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms / cap_divisor),
            jitter: true,
        }
    }

    /// Delay before the given retry. `attempt` is the 1-based attempt that
    /// just failed, so the first retry waits `base_delay`.
    fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let exp = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp.min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..jitter_range_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Fans one notification out to its channel adapters, each with an
/// independent retry loop, and falls back to alternate channels when every
/// primary channel fails.
///
/// Concurrency across logical deliveries is bounded by a semaphore
/// acquired once per `deliver` call; channels within a delivery always run
/// concurrently.
pub struct DeliveryOrchestrator {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    config: DeliveryConfig,
    semaphore: Arc<Semaphore>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl DeliveryOrchestrator {
    pub fn new(
        config: DeliveryConfig,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        max_concurrent: usize,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.channel(), a))
            .collect();
        Self {
            adapters,
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            metrics,
            shutdown,
        }
    }

    /// Initialize every registered adapter. Called once before the engine
    /// starts ticking; a failing adapter aborts startup.
    pub async fn initialize(&self) -> Result<(), ChannelError> {
        for adapter in self.adapters.values() {
            adapter.initialize().await?;
        }
        Ok(())
    }

    /// Shut every adapter down. Failures are logged, not propagated, so
    /// one bad adapter cannot block the rest from flushing.
    pub async fn shutdown_adapters(&self) {
        for (channel, adapter) in &self.adapters {
            if let Err(e) = adapter.shutdown().await {
                warn!(%channel, error = %e, "adapter shutdown failed");
            }
        }
    }

    /// Deliver one notification across its effective channels, returning
    /// one result per attempt made. `optimized` narrows/reorders the
    /// requested channels when admission suggested a better set; channels
    /// outside the notification's own list are ignored.
    pub async fn deliver(
        &self,
        notification: &Notification,
        optimized: Option<&[Channel]>,
    ) -> Vec<DeliveryResult> {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(id = %notification.id, "delivery semaphore closed, dropping delivery");
                return Vec::new();
            }
        };

        let channels = self.effective_channels(notification, optimized);
        let delivery_id = Uuid::now_v7();
        let policy = RetryPolicy::for_priority(&self.config, notification.priority);

        let mut results = self
            .run_round(notification, &channels, &policy, delivery_id, false)
            .await;

        let any_success = results.iter().any(|r| r.success);
        if !any_success && self.config.enable_fallback {
            let fallbacks: Vec<Channel> = self
                .config
                .fallback_channels
                .iter()
                .copied()
                .filter(|c| !channels.contains(c) && self.adapters.contains_key(c))
                .collect();
            if !fallbacks.is_empty() {
                debug!(id = %notification.id, ?fallbacks, "all primary channels failed, entering fallback round");
                self.metrics.record_fallback_round();
                // Fallback channels get a single attempt each.
                let single = RetryPolicy {
                    max_attempts: 1,
                    ..policy
                };
                let mut fallback_results = self
                    .run_round(notification, &fallbacks, &single, delivery_id, true)
                    .await;
                results.append(&mut fallback_results);
            }
        }

        results
    }

    async fn run_round(
        &self,
        notification: &Notification,
        channels: &[Channel],
        policy: &RetryPolicy,
        delivery_id: Uuid,
        fallback: bool,
    ) -> Vec<DeliveryResult> {
        let tasks = channels.iter().map(|channel| {
            self.deliver_channel(notification, *channel, policy, delivery_id, fallback)
        });
        join_all(tasks).await.into_iter().flatten().collect()
    }

    /// Retry loop for one channel. Returns every attempt's result; stops
    /// early on success, a permanent error classification, or shutdown.
    async fn deliver_channel(
        &self,
        notification: &Notification,
        channel: Channel,
        policy: &RetryPolicy,
        delivery_id: Uuid,
        fallback: bool,
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::new();
        let Some(adapter) = self.adapters.get(&channel) else {
            let err = ChannelError::new(channel, ErrorKind::Unsupported, "no adapter registered");
            let mut result =
                DeliveryResult::failed(notification.id, channel, 1, Duration::ZERO, &err);
            result.fallback = fallback;
            self.metrics.record_attempt(channel, false);
            results.push(result);
            return results;
        };

        let attempt_timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        for attempt in 1..=policy.max_attempts {
            if self.shutdown.is_cancelled() {
                break;
            }
            let ctx = AttemptContext {
                delivery_id,
                attempt,
                max_attempts: policy.max_attempts,
            };
            let started = Instant::now();
            let outcome = tokio::time::timeout(attempt_timeout, adapter.deliver(notification, &ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(ChannelError::new(
                        channel,
                        ErrorKind::Timeout,
                        format!("attempt exceeded {}ms", attempt_timeout.as_millis()),
                    ))
                });
            let latency = started.elapsed();

            match outcome {
                Ok(()) => {
                    let mut result =
                        DeliveryResult::ok(notification.id, channel, attempt, latency);
                    result.fallback = fallback;
                    self.metrics.record_attempt(channel, true);
                    results.push(result);
                    return results;
                }
                Err(err) => {
                    debug!(
                        id = %notification.id,
                        %channel,
                        attempt,
                        error = %err,
                        "delivery attempt failed"
                    );
                    let mut result =
                        DeliveryResult::failed(notification.id, channel, attempt, latency, &err);
                    result.fallback = fallback;
                    self.metrics.record_attempt(channel, false);
                    results.push(result);
                    if !err.kind.is_retryable() {
                        break;
                    }
                }
            }

            if attempt < policy.max_attempts {
                let delay = policy.delay_after_attempt(attempt);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        results
    }

    /// Requested channels, narrowed/reordered by the admission hint, then
    /// ordered by priority class preference.
    fn effective_channels(
        &self,
        notification: &Notification,
        optimized: Option<&[Channel]>,
    ) -> Vec<Channel> {
        let mut channels: Vec<Channel> = match optimized {
            Some(hint) => {
                let narrowed: Vec<Channel> = hint
                    .iter()
                    .copied()
                    .filter(|c| notification.channels.contains(c))
                    .collect();
                if narrowed.is_empty() {
                    notification.channels.clone()
                } else {
                    narrowed
                }
            }
            None => notification.channels.clone(),
        };
        channels.dedup();
        order_for_priority(notification.priority, channels)
    }
}

/// Urgent work goes to immediate channels first; low-priority work to
/// unobtrusive ones. Other tiers keep the requested order.
fn order_for_priority(priority: Priority, mut channels: Vec<Channel>) -> Vec<Channel> {
    let preference: &[Channel] = match priority {
        Priority::Critical | Priority::Urgent => &[
            Channel::Socket,
            Channel::Push,
            Channel::InApp,
            Channel::Sms,
            Channel::Email,
        ],
        Priority::Low => &[
            Channel::InApp,
            Channel::Email,
            Channel::Socket,
            Channel::Push,
            Channel::Sms,
        ],
        Priority::Normal | Priority::High => return channels,
    };
    channels.sort_by_key(|c| preference.iter().position(|p| p == c));
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NewNotification, NotificationType, Payload};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Adapter that fails the first `failures` attempts, then succeeds.
    struct FlakyAdapter {
        channel: Channel,
        failures: u32,
        kind: ErrorKind,
        calls: AtomicU32,
    }

    impl FlakyAdapter {
        fn new(channel: Channel, failures: u32, kind: ErrorKind) -> Self {
            Self {
                channel,
                failures,
                kind,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for FlakyAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn deliver(
            &self,
            _notification: &Notification,
            _ctx: &AttemptContext,
        ) -> Result<(), ChannelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ChannelError::new(self.channel, self.kind, "provider error"))
            } else {
                Ok(())
            }
        }
    }

    struct SlowAdapter {
        channel: Channel,
    }

    #[async_trait]
    impl ChannelAdapter for SlowAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn deliver(
            &self,
            _notification: &Notification,
            _ctx: &AttemptContext,
        ) -> Result<(), ChannelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn notification(priority: Priority, channels: Vec<Channel>) -> Notification {
        NewNotification {
            kind: NotificationType::GameStart,
            priority,
            user_id: "u1".into(),
            channels,
            payload: Payload::new("Kickoff", "Your game is starting"),
            scheduled_at: None,
            expires_at: None,
        }
        .into_notification(Utc::now())
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            base_backoff_ms: 10,
            max_backoff_ms: 100,
            attempt_timeout_ms: 1_000,
            ..DeliveryConfig::default()
        }
    }

    fn orchestrator(
        config: DeliveryConfig,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> DeliveryOrchestrator {
        DeliveryOrchestrator::new(
            config,
            adapters,
            8,
            Arc::new(Metrics::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn critical_succeeds_on_third_attempt() {
        let adapter = Arc::new(FlakyAdapter::new(Channel::Push, 2, ErrorKind::Transient));
        let orch = orchestrator(config(), vec![adapter.clone()]);
        let n = notification(Priority::Critical, vec![Channel::Push]);

        let results = orch.deliver(&n, None).await;
        assert_eq!(results.len(), 3);
        assert!(!results[0].success);
        assert!(!results[1].success);
        assert!(results[2].success);
        assert_eq!(results[2].attempt, 3);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn low_priority_gets_single_attempt() {
        let adapter = Arc::new(FlakyAdapter::new(Channel::Email, 10, ErrorKind::Transient));
        let mut cfg = config();
        cfg.enable_fallback = false;
        let orch = orchestrator(cfg, vec![adapter.clone()]);
        let n = notification(Priority::Low, vec![Channel::Email]);

        let results = orch.deliver(&n, None).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_retries() {
        let adapter = Arc::new(FlakyAdapter::new(Channel::Sms, 10, ErrorKind::InvalidTarget));
        let mut cfg = config();
        cfg.enable_fallback = false;
        let orch = orchestrator(cfg, vec![adapter.clone()]);
        let n = notification(Priority::Critical, vec![Channel::Sms]);

        let results = orch.deliver(&n, None).await;
        assert_eq!(results.len(), 1, "InvalidTarget must not be retried");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failed_attempt() {
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(SlowAdapter {
            channel: Channel::Push,
        });
        let mut cfg = config();
        cfg.enable_fallback = false;
        let orch = orchestrator(cfg, vec![adapter]);
        let n = notification(Priority::Low, vec![Channel::Push]);

        let results = orch.deliver(&n, None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_round_after_all_primaries_fail() {
        let push = Arc::new(FlakyAdapter::new(Channel::Push, 10, ErrorKind::Transient));
        let in_app = Arc::new(FlakyAdapter::new(Channel::InApp, 0, ErrorKind::Transient));
        let mut cfg = config();
        cfg.fallback_channels = vec![Channel::InApp];
        let orch = orchestrator(cfg, vec![push.clone(), in_app.clone()]);
        let n = notification(Priority::Low, vec![Channel::Push]);

        let results = orch.deliver(&n, None).await;
        let fallback: Vec<&DeliveryResult> = results.iter().filter(|r| r.fallback).collect();
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].channel, Channel::InApp);
        assert!(fallback[0].success);
        assert_eq!(in_app.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_never_repeats_an_attempted_channel() {
        let in_app = Arc::new(FlakyAdapter::new(Channel::InApp, 10, ErrorKind::Transient));
        let mut cfg = config();
        cfg.fallback_channels = vec![Channel::InApp];
        let orch = orchestrator(cfg, vec![in_app.clone()]);
        // InApp is already a primary channel, so the fallback round is empty
        let n = notification(Priority::Low, vec![Channel::InApp]);

        let results = orch.deliver(&n, None).await;
        assert!(results.iter().all(|r| !r.fallback));
        assert_eq!(in_app.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_fallback_when_any_primary_succeeds() {
        let push = Arc::new(FlakyAdapter::new(Channel::Push, 10, ErrorKind::Transient));
        let email = Arc::new(FlakyAdapter::new(Channel::Email, 0, ErrorKind::Transient));
        let in_app = Arc::new(FlakyAdapter::new(Channel::InApp, 0, ErrorKind::Transient));
        let mut cfg = config();
        cfg.fallback_channels = vec![Channel::InApp];
        let orch = orchestrator(cfg, vec![push, email, in_app.clone()]);
        let n = notification(Priority::Normal, vec![Channel::Push, Channel::Email]);

        let results = orch.deliver(&n, None).await;
        assert!(results.iter().any(|r| r.success));
        assert_eq!(in_app.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_adapter_reports_unsupported() {
        let mut cfg = config();
        cfg.enable_fallback = false;
        let orch = orchestrator(cfg, vec![]);
        let n = notification(Priority::Normal, vec![Channel::Sms]);

        let results = orch.deliver(&n, None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind, Some(ErrorKind::Unsupported));
    }

    #[tokio::test(start_paused = true)]
    async fn optimized_hint_narrows_channels() {
        let push = Arc::new(FlakyAdapter::new(Channel::Push, 0, ErrorKind::Transient));
        let email = Arc::new(FlakyAdapter::new(Channel::Email, 0, ErrorKind::Transient));
        let orch = orchestrator(config(), vec![push.clone(), email.clone()]);
        let n = notification(Priority::Normal, vec![Channel::Push, Channel::Email]);

        orch.deliver(&n, Some(&[Channel::Email])).await;
        assert_eq!(email.calls.load(Ordering::SeqCst), 1);
        assert_eq!(push.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn channel_order_by_priority_class() {
        let requested = vec![Channel::Email, Channel::Push, Channel::Socket];
        assert_eq!(
            order_for_priority(Priority::Critical, requested.clone()),
            vec![Channel::Socket, Channel::Push, Channel::Email]
        );
        assert_eq!(
            order_for_priority(Priority::Low, requested.clone()),
            vec![Channel::Email, Channel::Socket, Channel::Push]
        );
        assert_eq!(order_for_priority(Priority::Normal, requested.clone()), requested);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3_000),
            jitter: false,
        };
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after_attempt(4), Duration::from_millis(3_000));
        assert_eq!(policy.delay_after_attempt(40), Duration::from_millis(3_000));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3_000),
            jitter: true,
        };
        for attempt in 1..=10 {
            for _ in 0..32 {
                assert!(policy.delay_after_attempt(attempt) <= Duration::from_millis(3_000));
            }
        }
    }

    #[test]
    fn priority_policies_scale_attempts_and_caps() {
        let cfg = DeliveryConfig::default();
        let critical = RetryPolicy::for_priority(&cfg, Priority::Critical);
        let low = RetryPolicy::for_priority(&cfg, Priority::Low);
        assert!(critical.max_attempts > low.max_attempts);
        assert!(critical.max_delay < low.max_delay);
    }
}
