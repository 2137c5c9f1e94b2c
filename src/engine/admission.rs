use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::cache::TtlCache;
use crate::engine::config::AdmissionConfig;
use crate::engine::ratelimit::{FrequencyExceeded, FrequencyLimiter};
use crate::notification::{Channel, Notification, NotificationType, Payload, Priority};

/// Confidence used when scoring fails and the filter falls open.
const FAIL_OPEN_CONFIDENCE: f64 = 0.5;

/// Engagement assumed for users without a behavior profile.
const DEFAULT_ENGAGEMENT_RATE: f64 = 0.5;

/// Words that push content toward the spam classification.
const SPAM_KEYWORDS: &[&str] = &[
    "free money",
    "winner",
    "congratulations you",
    "claim now",
    "act now",
    "limited time",
    "click here",
    "guaranteed",
];

/// Read-only snapshot of a user's notification behavior, supplied by the
/// host application. A missing profile is normal and scored with defaults.
#[derive(Debug, Clone, Default)]
pub struct BehaviorProfile {
    /// Fraction of recent notifications the user opened, in [0, 1].
    pub engagement_rate: f64,
    /// Channels the user engages with most, best first.
    pub preferred_channels: Vec<Channel>,
    /// Hours of day (UTC, 0-23) the user is typically active.
    pub peak_hours: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
#[error("profile lookup failed: {0}")]
pub struct ProfileError(pub String);

/// Source of behavior profiles. Implementations must not block; this is
/// called on the delivery path.
pub trait ProfileProvider: Send + Sync {
    fn profile(&self, user_id: &str) -> Result<Option<BehaviorProfile>, ProfileError>;
}

/// Provider used when the host wires nothing in: every user scores with
/// the built-in defaults.
pub struct NoProfileProvider;

impl ProfileProvider for NoProfileProvider {
    fn profile(&self, _user_id: &str) -> Result<Option<BehaviorProfile>, ProfileError> {
        Ok(None)
    }
}

/// Hints the filter attaches to an allow decision. The engine applies
/// what it can and ignores the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Optimizations {
    /// Reordered (possibly narrowed) channel list, best first.
    pub channels: Option<Vec<Channel>>,
    /// Defer delivery to this instant (never set for urgent/critical).
    pub deliver_at: Option<DateTime<Utc>>,
    pub priority: Option<Priority>,
    /// Replacement payload. None of the built-in heuristics rewrite
    /// content; custom filters set this and the engine delivers it as-is.
    pub content: Option<Payload>,
}

impl Optimizations {
    fn is_empty(&self) -> bool {
        self.channels.is_none()
            && self.deliver_at.is_none()
            && self.priority.is_none()
            && self.content.is_none()
    }
}

/// Outcome of one admission evaluation. Transient; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    pub deliver: bool,
    pub confidence: f64,
    pub reason: String,
    pub optimizations: Option<Optimizations>,
}

impl AdmissionDecision {
    fn allow(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            deliver: true,
            confidence,
            reason: reason.into(),
            optimizations: None,
        }
    }

    fn block(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            deliver: false,
            confidence,
            reason: reason.into(),
            optimizations: None,
        }
    }
}

struct State {
    /// User-wide sliding windows.
    user_freq: FrequencyLimiter,
    /// Per-(user, kind) sliding windows, keyed `user/kind`.
    kind_freq: FrequencyLimiter,
    /// Content fingerprint -> sends within the duplicate window.
    fingerprints: TtlCache<u64, u32>,
}

/// Admission control: frequency caps, spam heuristics, relevance and
/// engagement scoring.
///
/// `evaluate` never consumes quota; the engine calls `record` exactly once
/// per admitted logical delivery, so re-evaluating at dequeue time cannot
/// double-count.
pub struct AdmissionFilter {
    config: AdmissionConfig,
    provider: Box<dyn ProfileProvider>,
    state: Mutex<State>,
}

impl AdmissionFilter {
    pub fn new(config: AdmissionConfig, provider: Box<dyn ProfileProvider>) -> Self {
        let window = Duration::from_secs(config.duplicate_window_secs.max(1));
        Self {
            state: Mutex::new(State {
                user_freq: FrequencyLimiter::new(config.max_per_hour, config.max_per_day),
                kind_freq: FrequencyLimiter::new(u32::MAX, u32::MAX),
                fingerprints: TtlCache::new(window),
            }),
            config,
            provider,
        }
    }

    /// Score a notification without consuming any quota.
    pub fn evaluate(&self, notification: &Notification, now: Instant) -> AdmissionDecision {
        if !self.config.enabled {
            return AdmissionDecision::allow(1.0, "admission disabled");
        }

        if let Some(exceeded) = self.check_frequency(notification, now) {
            let reason = match exceeded {
                FrequencyExceeded::Hourly { count, limit } => {
                    format!("hourly frequency cap reached ({count}/{limit})")
                }
                FrequencyExceeded::Daily { count, limit } => {
                    format!("daily frequency cap reached ({count}/{limit})")
                }
            };
            debug!(id = %notification.id, user = %notification.user_id, %reason, "admission declined");
            return AdmissionDecision::block(1.0, reason);
        }

        let spam = self.spam_score(notification, now);
        if spam >= self.config.spam_block_threshold {
            debug!(id = %notification.id, spam, "admission declined, spam score over hard block");
            return AdmissionDecision::block(1.0, format!("spam score {spam:.2}"));
        }

        // Profile failures fall open: allow at a neutral confidence and say so.
        let profile = match self.provider.profile(&notification.user_id) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user = %notification.user_id, error = %e, "profile lookup failed, failing open");
                return AdmissionDecision::allow(
                    FAIL_OPEN_CONFIDENCE,
                    format!("scoring unavailable, failing open: {e}"),
                );
            }
        };

        let relevance = relevance_score(notification, Utc::now());
        let engagement = profile
            .as_ref()
            .map(|p| p.engagement_rate.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_ENGAGEMENT_RATE);

        // Spam that clears the hard block still drags confidence down.
        let confidence = ((relevance * 0.7 + engagement * 0.3) * (1.0 - spam)).clamp(0.0, 1.0);
        if confidence < self.config.confidence_threshold {
            return AdmissionDecision::block(
                confidence,
                format!("confidence {confidence:.2} below threshold"),
            );
        }

        let optimizations = self.optimize(notification, profile.as_ref());
        let mut decision = AdmissionDecision::allow(confidence, "admitted");
        decision.optimizations = optimizations;
        decision
    }

    /// Consume quota for an admitted delivery. Call once per logical
    /// delivery, not per channel or attempt.
    pub fn record(&self, notification: &Notification, now: Instant) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.state.lock();
        state.user_freq.record(&notification.user_id, now);
        state
            .kind_freq
            .record(&kind_key(notification), now);
        let fp = fingerprint(notification);
        let count = state.fingerprints.get(&fp, now).copied().unwrap_or(0);
        state.fingerprints.insert(fp, count + 1, now);
    }

    /// Drop expired rate-limit and fingerprint state. The engine calls
    /// this periodically from the tick loop.
    pub fn sweep(&self, now: Instant) {
        let mut state = self.state.lock();
        state.user_freq.sweep(now);
        state.kind_freq.sweep(now);
        state.fingerprints.sweep(now);
    }

    fn check_frequency(&self, notification: &Notification, now: Instant) -> Option<FrequencyExceeded> {
        let mut state = self.state.lock();
        if let Some(exceeded) = state.user_freq.check(&notification.user_id, now) {
            return Some(exceeded);
        }
        let cap = self
            .config
            .kind_max_per_hour
            .get(notification.kind.as_str())
            .copied()
            .or_else(|| default_kind_hourly_cap(notification.kind));
        if let Some(cap) = cap {
            return state
                .kind_freq
                .check_within(&kind_key(notification), now, cap, u32::MAX);
        }
        None
    }

    fn spam_score(&self, notification: &Notification, now: Instant) -> f64 {
        let text = format!(
            "{} {}",
            notification.payload.title, notification.payload.message
        )
        .to_lowercase();

        let mut score: f64 = 0.0;
        if SPAM_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            score += 0.3;
        }
        if excessive_punctuation(&text) {
            score += 0.2;
        }
        if shouting(&notification.payload.title) || shouting(&notification.payload.message) {
            score += 0.3;
        }
        let duplicates = {
            let state = self.state.lock();
            let fp = fingerprint(notification);
            state.fingerprints.get(&fp, now).copied().unwrap_or(0)
        };
        if duplicates >= 3 {
            score += 0.4;
        } else if duplicates >= 1 {
            score += 0.2;
        }
        score.min(1.0)
    }

    fn optimize(
        &self,
        notification: &Notification,
        profile: Option<&BehaviorProfile>,
    ) -> Option<Optimizations> {
        let profile = profile?;
        let mut opt = Optimizations::default();

        // Preferred channels first, remaining requested channels after.
        let preferred: Vec<Channel> = profile
            .preferred_channels
            .iter()
            .copied()
            .filter(|c| notification.channels.contains(c))
            .collect();
        if !preferred.is_empty() && preferred != notification.channels {
            let mut reordered = preferred.clone();
            for c in &notification.channels {
                if !reordered.contains(c) {
                    reordered.push(*c);
                }
            }
            if reordered != notification.channels {
                opt.channels = Some(reordered);
            }
        }

        // Defer routine notifications to the user's next peak hour.
        if notification.priority < Priority::Urgent && !profile.peak_hours.is_empty() {
            let now = Utc::now();
            if !profile.peak_hours.contains(&now.hour()) {
                if let Some(at) = next_peak(now, &profile.peak_hours) {
                    opt.deliver_at = Some(at);
                }
            }
        }

        if opt.is_empty() {
            None
        } else {
            Some(opt)
        }
    }
}

/// Built-in per-kind hourly ceilings for the chattiest kinds; anything not
/// listed is bounded only by the user-wide caps.
fn default_kind_hourly_cap(kind: NotificationType) -> Option<u32> {
    match kind {
        NotificationType::ScoreUpdate => Some(10),
        NotificationType::PlayerNews => Some(5),
        NotificationType::BreakingNews => Some(3),
        NotificationType::WeeklyRecap => Some(1),
        _ => None,
    }
}

fn kind_key(notification: &Notification) -> String {
    format!("{}/{}", notification.user_id, notification.kind.as_str())
}

fn fingerprint(notification: &Notification) -> u64 {
    let mut hasher = DefaultHasher::new();
    notification.user_id.hash(&mut hasher);
    notification.payload.title.hash(&mut hasher);
    notification.payload.message.hash(&mut hasher);
    hasher.finish()
}

fn excessive_punctuation(text: &str) -> bool {
    let marks = text.chars().filter(|c| *c == '!' || *c == '?').count();
    marks >= 3 || text.contains("!!") || text.contains("??")
}

fn shouting(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 10 {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64 > 0.5
}

/// Weighted content (0.4) / timing (0.3) / context (0.3) relevance.
fn relevance_score(notification: &Notification, now: DateTime<Utc>) -> f64 {
    let payload = &notification.payload;

    let content = if payload.title.trim().is_empty() || payload.message.trim().is_empty() {
        0.0
    } else {
        0.4
    };

    let timing = if notification.kind.is_game_sensitive() {
        if is_game_day(now) {
            0.3
        } else {
            0.15
        }
    } else {
        0.24
    };

    let ctx = &payload.context;
    let keys = [&ctx.league_id, &ctx.team_id, &ctx.player_id, &ctx.game_id]
        .iter()
        .filter(|k| k.is_some())
        .count();
    let context = match keys {
        0 => 0.1,
        1 => 0.2,
        _ => 0.3,
    };

    content + timing + context
}

/// NFL-style game days.
fn is_game_day(now: DateTime<Utc>) -> bool {
    matches!(
        now.weekday(),
        Weekday::Sun | Weekday::Mon | Weekday::Thu
    )
}

/// The next instant (on the hour) falling inside one of `peak_hours`.
fn next_peak(now: DateTime<Utc>, peak_hours: &[u32]) -> Option<DateTime<Utc>> {
    for ahead in 1..=24i64 {
        let candidate = now + chrono::Duration::hours(ahead);
        if peak_hours.contains(&candidate.hour()) {
            return candidate
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0));
        }
    }
    None
}
