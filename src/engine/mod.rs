pub mod admission;
pub mod cache;
pub mod channel;
pub mod config;
pub mod delivery;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod stats;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::admission::{AdmissionFilter, NoProfileProvider, Optimizations, ProfileProvider};
use crate::engine::cache::TtlCache;
use crate::engine::channel::ChannelAdapter;
use crate::engine::config::EngineConfig;
use crate::engine::delivery::DeliveryOrchestrator;
use crate::engine::events::{EventBus, EventKind, NotificationEvent};
use crate::engine::metrics::Metrics;
use crate::engine::queue::PriorityQueue;
use crate::engine::stats::{EngineStats, QueueStats};
use crate::error::{CreateError, CreateResult, EngineError, EngineResult};
use crate::notification::{Channel, NewNotification, Notification, NotificationStatus};
use crate::store::{QueueRecord, QueueStore};

/// How long terminal statuses stay queryable after their last update.
const STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Event bus capacity per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Expired admission/rate-limit state is reclaimed every this many ticks.
const SWEEP_EVERY_TICKS: u64 = 60;

struct StatusRecord {
    status: NotificationStatus,
    user_id: String,
    reason: Option<String>,
}

/// The notification engine: owns the queue, admission filter, orchestrator
/// and event bus, and drives the fixed-interval delivery loop.
///
/// Everything is injected at construction; there are no globals. Clone the
/// `Arc` freely; all methods take `&self`.
pub struct Engine {
    config: EngineConfig,
    queue: PriorityQueue,
    admission: AdmissionFilter,
    orchestrator: DeliveryOrchestrator,
    events: EventBus,
    metrics: Arc<Metrics>,
    statuses: Mutex<TtlCache<Uuid, StatusRecord>>,
    stats: Mutex<EngineStats>,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Engine with no persistence and default profile scoring.
    pub fn new(config: EngineConfig, adapters: Vec<Arc<dyn ChannelAdapter>>) -> Arc<Self> {
        Self::with_parts(config, adapters, None, Box::new(NoProfileProvider))
    }

    pub fn with_parts(
        config: EngineConfig,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        store: Option<Arc<dyn QueueStore>>,
        provider: Box<dyn ProfileProvider>,
    ) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();
        let orchestrator = DeliveryOrchestrator::new(
            config.delivery.clone(),
            adapters,
            config.engine.max_concurrent_deliveries,
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        Arc::new(Self {
            queue: PriorityQueue::with_store(config.queue.max_size, store),
            admission: AdmissionFilter::new(config.admission.clone(), provider),
            orchestrator,
            events: EventBus::new(EVENT_CHANNEL_CAPACITY),
            metrics,
            statuses: Mutex::new(TtlCache::new(STATUS_TTL)),
            stats: Mutex::new(EngineStats::default()),
            shutdown,
            loop_handle: Mutex::new(None),
            config,
        })
    }

    /// Initialize adapters, recover persisted queue entries, and start the
    /// tick loop.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        {
            let handle = self.loop_handle.lock();
            if handle.is_some() {
                return Err(EngineError::AlreadyRunning);
            }
        }
        self.orchestrator.initialize().await?;
        let restored = self.queue.restore(Utc::now())?;
        if restored > 0 {
            info!(restored, "recovered persisted queue entries");
        }
        let engine = Arc::clone(self);
        let handle = tokio::spawn(engine.run_loop());
        *self.loop_handle.lock() = Some(handle);
        info!(
            tick_ms = self.config.engine.tick_interval_ms,
            batch = self.config.engine.batch_size,
            "engine started"
        );
        Ok(())
    }

    /// Stop the tick loop, let in-flight deliveries finish, and shut the
    /// adapters down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "tick loop task failed during shutdown");
            }
        }
        info!("engine stopped");
    }

    /// Validate, run the admission pre-check, and queue a notification.
    ///
    /// A blocked notification is not an error: it gets an id, a terminal
    /// `Blocked` status and a lifecycle event, and never touches the queue.
    pub fn create(&self, new: NewNotification) -> CreateResult<Uuid> {
        if self.shutdown.is_cancelled() {
            return Err(CreateError::ShutDown);
        }
        validate(&new)?;

        let now = Utc::now();
        let notification = new.into_notification(now);
        let id = notification.id;

        let decision = self.admission.evaluate(&notification, Instant::now());
        if !decision.deliver {
            self.record_blocked(&notification, &decision.reason);
            return Ok(id);
        }

        let scheduled_at = notification.effective_schedule();
        let user_id = notification.user_id.clone();
        let priority = notification.priority;
        let accepted = if scheduled_at > now {
            self.queue.schedule(notification, scheduled_at)
        } else {
            self.queue.enqueue(notification)
        };
        if !accepted {
            return Err(CreateError::QueueFull(self.config.queue.max_size));
        }

        self.set_status(id, &user_id, NotificationStatus::Queued, None);
        self.metrics.record_created(priority);
        self.metrics.set_queue_depth(self.queue.len() as u64);
        self.stats.lock().created += 1;
        self.events
            .publish(NotificationEvent::new(EventKind::Created, id, &user_id));
        Ok(id)
    }

    /// Delete a queued or scheduled notification. Returns false when the
    /// id is unknown or already being delivered.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let removed = self.queue.remove(id);
        if removed {
            self.statuses.lock().remove(id);
        }
        removed
    }

    /// Record that the user opened the notification.
    pub fn mark_read(&self, id: Uuid, user_id: &str) -> EngineResult<()> {
        self.engagement(id, user_id, EventKind::Read)
    }

    /// Record that the user followed the notification's action.
    pub fn track_click(&self, id: Uuid, user_id: &str) -> EngineResult<()> {
        self.engagement(id, user_id, EventKind::Clicked)
    }

    fn engagement(&self, id: Uuid, user_id: &str, kind: EventKind) -> EngineResult<()> {
        {
            let mut statuses = self.statuses.lock();
            let now = Instant::now();
            let Some(record) = statuses.get_mut(&id, now) else {
                return Err(EngineError::NotFound(id));
            };
            if record.user_id != user_id {
                return Err(EngineError::WrongUser(id, user_id.to_string()));
            }
            // A read can only follow a delivery; blocked, failed and
            // expired statuses keep telling the truth. The event still
            // goes out so engagement signals are never lost.
            if matches!(
                record.status,
                NotificationStatus::Delivered | NotificationStatus::Sent
            ) {
                record.status = NotificationStatus::Read;
            }
        }
        self.events
            .publish(NotificationEvent::new(kind, id, user_id));
        Ok(())
    }

    pub fn status(&self, id: &Uuid) -> Option<NotificationStatus> {
        self.statuses
            .lock()
            .get(id, Instant::now())
            .map(|r| r.status)
    }

    /// Subscribe to lifecycle events. A slow subscriber loses events
    /// rather than slowing the engine down.
    pub fn subscribe(&self) -> tokio::sync::mpsc::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    async fn run_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.engine.tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    while let Some(joined) = inflight.try_join_next() {
                        if let Err(e) = joined {
                            warn!(error = %e, "delivery task panicked");
                        }
                    }
                    self.tick(&mut inflight);
                    ticks += 1;
                    if ticks % SWEEP_EVERY_TICKS == 0 {
                        let now = Instant::now();
                        self.admission.sweep(now);
                        self.statuses.lock().sweep(now);
                    }
                }
            }
        }

        // Drain in-flight deliveries before releasing adapter resources.
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "delivery task panicked");
            }
        }
        self.orchestrator.shutdown_adapters().await;
    }

    fn tick(self: &Arc<Self>, inflight: &mut JoinSet<()>) {
        let now = Utc::now();
        let batch = self.queue.dequeue(self.config.engine.batch_size, now);
        self.metrics.set_queue_depth(self.queue.len() as u64);
        if batch.is_empty() {
            return;
        }
        debug!(size = batch.len(), "processing tick batch");
        for record in batch {
            let engine = Arc::clone(self);
            inflight.spawn(engine.process_one(record));
        }
    }

    /// Drive one dequeued notification through admission, delivery and
    /// status derivation. Never returns an error; every outcome is a
    /// recorded status.
    async fn process_one(self: Arc<Self>, record: QueueRecord) {
        let mut notification = record.notification;
        let id = notification.id;
        let now = Utc::now();

        if notification.is_expired(now) {
            self.queue.mark_processed(&id, false);
            self.set_status(
                id,
                &notification.user_id,
                NotificationStatus::Expired,
                Some("expired before delivery".into()),
            );
            self.metrics.record_expired();
            self.stats.lock().expired += 1;
            self.events.publish(NotificationEvent::new(
                EventKind::Expired,
                id,
                &notification.user_id,
            ));
            return;
        }

        // Conditions can change while an entry waits in the queue, so
        // admission gets the final word here.
        let decision = self.admission.evaluate(&notification, Instant::now());
        if !decision.deliver {
            self.queue.mark_processed(&id, false);
            self.record_blocked(&notification, &decision.reason);
            return;
        }

        let mut optimized_channels: Option<Vec<Channel>> = None;
        if let Some(opt) = &decision.optimizations {
            optimized_channels = apply_optimizations(&mut notification, opt);
            if let Some(at) = opt.deliver_at {
                if at > now {
                    // A deferral is not a completed cycle; the entry just
                    // moves back to the scheduled set.
                    self.queue.release(&id);
                    if self.queue.schedule(notification.clone(), at) {
                        debug!(%id, deliver_at = %at, "deferred to user's peak window");
                        return;
                    }
                    // Queue full: deliver now rather than drop.
                }
            }
        }

        self.admission.record(&notification, Instant::now());
        let results = self
            .orchestrator
            .deliver(&notification, optimized_channels.as_deref())
            .await;

        let primary: HashSet<Channel> = results
            .iter()
            .filter(|r| !r.fallback)
            .map(|r| r.channel)
            .collect();
        let primary_ok: HashSet<Channel> = results
            .iter()
            .filter(|r| !r.fallback && r.success)
            .map(|r| r.channel)
            .collect();
        let any_success = results.iter().any(|r| r.success);
        let fallback_used = results.iter().any(|r| r.fallback && r.success);
        let last_error = results.iter().rev().find_map(|r| r.error.clone());

        if any_success && primary_ok.len() == primary.len() && !primary.is_empty() {
            self.queue.mark_processed(&id, true);
            self.set_status(id, &notification.user_id, NotificationStatus::Delivered, None);
            self.metrics.record_delivered();
            self.stats.lock().delivered += 1;
            self.events.publish(NotificationEvent::new(
                EventKind::Delivered,
                id,
                &notification.user_id,
            ));
        } else if any_success {
            self.queue.mark_processed(&id, true);
            notification.meta.fallback_used = fallback_used;
            self.set_status(id, &notification.user_id, NotificationStatus::Sent, None);
            self.stats.lock().sent += 1;
            self.events.publish(
                NotificationEvent::new(EventKind::Sent, id, &notification.user_id).with_data(
                    serde_json::json!({ "fallback_used": fallback_used }),
                ),
            );
        } else {
            self.queue.mark_processed(&id, false);
            let retryable = results
                .iter()
                .any(|r| r.error_kind.is_some_and(|k| k.is_retryable()));
            if retryable && notification.meta.redeliveries < self.config.engine.max_redeliveries {
                notification.meta.redeliveries += 1;
                notification.meta.last_error = last_error.clone();
                let at = now + redelivery_delay(&self.config, notification.meta.redeliveries);
                if self.queue.schedule(notification.clone(), at) {
                    debug!(%id, cycle = notification.meta.redeliveries, retry_at = %at, "re-queued failed delivery");
                    self.stats.lock().redelivered += 1;
                    return;
                }
            }
            self.set_status(
                id,
                &notification.user_id,
                NotificationStatus::Failed,
                notification.meta.last_error.clone().or(last_error.clone()),
            );
            self.metrics.record_failed();
            self.stats.lock().failed += 1;
            self.events.publish(
                NotificationEvent::new(EventKind::Failed, id, &notification.user_id)
                    .with_data(serde_json::json!({ "error": last_error })),
            );
        }
    }

    fn record_blocked(&self, notification: &Notification, reason: &str) {
        debug!(id = %notification.id, reason, "notification blocked");
        self.set_status(
            notification.id,
            &notification.user_id,
            NotificationStatus::Blocked,
            Some(reason.to_string()),
        );
        self.metrics.record_blocked(reason);
        self.stats.lock().blocked += 1;
        self.events.publish(
            NotificationEvent::new(EventKind::Blocked, notification.id, &notification.user_id)
                .with_data(serde_json::json!({ "reason": reason })),
        );
    }

    fn set_status(
        &self,
        id: Uuid,
        user_id: &str,
        status: NotificationStatus,
        reason: Option<String>,
    ) {
        self.statuses.lock().insert(
            id,
            StatusRecord {
                status,
                user_id: user_id.to_string(),
                reason,
            },
            Instant::now(),
        );
    }

    /// Why a notification ended up blocked or failed, if it did.
    pub fn status_reason(&self, id: &Uuid) -> Option<String> {
        self.statuses
            .lock()
            .get(id, Instant::now())
            .and_then(|r| r.reason.clone())
    }
}

fn validate(new: &NewNotification) -> CreateResult<()> {
    if new.user_id.trim().is_empty() {
        return Err(CreateError::Validation("user_id is required".into()));
    }
    if new.payload.title.trim().is_empty() {
        return Err(CreateError::Validation("title is required".into()));
    }
    if new.payload.message.trim().is_empty() {
        return Err(CreateError::Validation("message is required".into()));
    }
    if new.channels.is_empty() {
        return Err(CreateError::Validation(
            "at least one channel is required".into(),
        ));
    }
    Ok(())
}

/// Apply admission hints to the notification in place. Returns the channel
/// override, which the orchestrator consumes separately.
fn apply_optimizations(
    notification: &mut Notification,
    opt: &Optimizations,
) -> Option<Vec<Channel>> {
    if let Some(priority) = opt.priority {
        notification.priority = priority;
    }
    if let Some(payload) = &opt.content {
        notification.payload = payload.clone();
    }
    opt.channels.clone()
}

/// Delay before redelivery cycle `cycle` (1-based): exponential from the
/// base backoff, capped at the configured ceiling.
fn redelivery_delay(config: &EngineConfig, cycle: u32) -> chrono::Duration {
    let multiplier = 1u64.checked_shl(cycle.saturating_sub(1)).unwrap_or(u64::MAX);
    let ms = config
        .delivery
        .base_backoff_ms
        .saturating_mul(multiplier)
        .min(config.delivery.max_backoff_ms);
    chrono::Duration::milliseconds(ms as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NotificationType, Payload, Priority};

    fn new_notification(channels: Vec<Channel>) -> NewNotification {
        NewNotification {
            kind: NotificationType::TradeProposal,
            priority: Priority::Normal,
            user_id: "u1".into(),
            channels,
            payload: Payload::new("Trade offer", "Alice offered you a trade"),
            scheduled_at: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn create_validates_input() {
        let engine = Engine::new(EngineConfig::default(), vec![]);

        let mut missing_user = new_notification(vec![Channel::Push]);
        missing_user.user_id = "  ".into();
        assert!(matches!(
            engine.create(missing_user),
            Err(CreateError::Validation(_))
        ));

        let no_channels = new_notification(vec![]);
        assert!(matches!(
            engine.create(no_channels),
            Err(CreateError::Validation(_))
        ));

        let mut empty_title = new_notification(vec![Channel::Push]);
        empty_title.payload.title = String::new();
        assert!(matches!(
            engine.create(empty_title),
            Err(CreateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn create_queues_and_emits_created() {
        let engine = Engine::new(EngineConfig::default(), vec![]);
        let mut events = engine.subscribe();

        let id = engine.create(new_notification(vec![Channel::Push])).unwrap();
        assert_eq!(engine.status(&id), Some(NotificationStatus::Queued));
        assert_eq!(engine.queue_stats().queued, 1);

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.notification_id, id);
    }

    #[tokio::test]
    async fn spam_is_blocked_without_queueing() {
        let engine = Engine::new(EngineConfig::default(), vec![]);
        let mut events = engine.subscribe();

        let mut spam = new_notification(vec![Channel::Push]);
        spam.payload = Payload::new(
            "CONGRATULATIONS YOU WON!!!",
            "CLAIM NOW!!! FREE MONEY GUARANTEED!!! CLICK HERE!!!",
        );
        let id = engine.create(spam).unwrap();

        assert_eq!(engine.status(&id), Some(NotificationStatus::Blocked));
        assert!(engine.status_reason(&id).unwrap().contains("spam"));
        assert_eq!(engine.queue_stats().queued, 0);
        assert_eq!(engine.stats().blocked, 1);
        assert_eq!(events.try_recv().unwrap().kind, EventKind::Blocked);
    }

    #[tokio::test]
    async fn queue_full_is_back_pressure() {
        let mut config = EngineConfig::default();
        config.queue.max_size = 1;
        let engine = Engine::new(config, vec![]);

        engine.create(new_notification(vec![Channel::Push])).unwrap();
        assert!(matches!(
            engine.create(new_notification(vec![Channel::Push])),
            Err(CreateError::QueueFull(1))
        ));
    }

    #[tokio::test]
    async fn future_scheduled_notification_waits() {
        let engine = Engine::new(EngineConfig::default(), vec![]);
        let mut n = new_notification(vec![Channel::Push]);
        n.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        let id = engine.create(n).unwrap();

        let stats = engine.queue_stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.queued, 0);
        assert!(engine.cancel(&id));
        assert_eq!(engine.queue_stats().scheduled, 0);
    }

    #[tokio::test]
    async fn mark_read_requires_matching_user() {
        let engine = Engine::new(EngineConfig::default(), vec![]);
        let id = engine.create(new_notification(vec![Channel::Push])).unwrap();

        assert!(matches!(
            engine.mark_read(id, "someone-else"),
            Err(EngineError::WrongUser(_, _))
        ));
        // Accepted for the right user, but a queued notification has not
        // been delivered yet, so its status does not move to read.
        engine.mark_read(id, "u1").unwrap();
        assert_eq!(engine.status(&id), Some(NotificationStatus::Queued));

        assert!(matches!(
            engine.mark_read(Uuid::now_v7(), "u1"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn read_never_overwrites_a_terminal_status() {
        let engine = Engine::new(EngineConfig::default(), vec![]);
        let mut events = engine.subscribe();

        let mut spam = new_notification(vec![Channel::Push]);
        spam.payload = Payload::new(
            "CONGRATULATIONS YOU WON!!!",
            "CLAIM NOW!!! FREE MONEY GUARANTEED!!! CLICK HERE!!!",
        );
        let id = engine.create(spam).unwrap();
        assert_eq!(engine.status(&id), Some(NotificationStatus::Blocked));

        engine.mark_read(id, "u1").unwrap();
        engine.track_click(id, "u1").unwrap();
        assert_eq!(engine.status(&id), Some(NotificationStatus::Blocked));

        // The engagement signals are still published.
        assert_eq!(events.try_recv().unwrap().kind, EventKind::Blocked);
        assert_eq!(events.try_recv().unwrap().kind, EventKind::Read);
        assert_eq!(events.try_recv().unwrap().kind, EventKind::Clicked);
    }

    #[test]
    fn optimizations_rewrite_priority_content_and_channels() {
        let mut n = new_notification(vec![Channel::Push, Channel::Email])
            .into_notification(Utc::now());
        let opt = Optimizations {
            channels: Some(vec![Channel::Email, Channel::Push]),
            deliver_at: None,
            priority: Some(Priority::Low),
            content: Some(Payload::new("Trade offer", "Shortened for push")),
        };

        let channels = apply_optimizations(&mut n, &opt);
        assert_eq!(channels, Some(vec![Channel::Email, Channel::Push]));
        assert_eq!(n.priority, Priority::Low);
        assert_eq!(n.payload.message, "Shortened for push");

        // No hints leave the notification untouched.
        let untouched = apply_optimizations(&mut n, &Optimizations::default());
        assert!(untouched.is_none());
        assert_eq!(n.priority, Priority::Low);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = Engine::new(EngineConfig::default(), vec![]);
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(EngineError::AlreadyRunning)
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn create_after_shutdown_is_rejected() {
        let engine = Engine::new(EngineConfig::default(), vec![]);
        engine.start().await.unwrap();
        engine.shutdown().await;
        assert!(matches!(
            engine.create(new_notification(vec![Channel::Push])),
            Err(CreateError::ShutDown)
        ));
    }

    #[test]
    fn redelivery_delay_doubles_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(redelivery_delay(&config, 1).num_milliseconds(), 500);
        assert_eq!(redelivery_delay(&config, 2).num_milliseconds(), 1_000);
        assert_eq!(redelivery_delay(&config, 3).num_milliseconds(), 2_000);
        assert_eq!(redelivery_delay(&config, 30).num_milliseconds(), 30_000);
    }
}
