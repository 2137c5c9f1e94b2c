use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Business event kinds the platform notifies about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TradeProposal,
    TradeAccepted,
    TradeRejected,
    TradeVetoed,
    WaiverWon,
    WaiverLost,
    LineupReminder,
    LineupDeadline,
    PlayerInjury,
    PlayerNews,
    GameStart,
    ScoreUpdate,
    CloseMatchup,
    MatchupWon,
    MatchupLost,
    WeeklyRecap,
    DraftPick,
    BreakingNews,
    LeagueMessage,
    AchievementUnlocked,
    SystemMaintenance,
    Custom,
}

impl NotificationType {
    /// Stable snake_case name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::TradeProposal => "trade_proposal",
            NotificationType::TradeAccepted => "trade_accepted",
            NotificationType::TradeRejected => "trade_rejected",
            NotificationType::TradeVetoed => "trade_vetoed",
            NotificationType::WaiverWon => "waiver_won",
            NotificationType::WaiverLost => "waiver_lost",
            NotificationType::LineupReminder => "lineup_reminder",
            NotificationType::LineupDeadline => "lineup_deadline",
            NotificationType::PlayerInjury => "player_injury",
            NotificationType::PlayerNews => "player_news",
            NotificationType::GameStart => "game_start",
            NotificationType::ScoreUpdate => "score_update",
            NotificationType::CloseMatchup => "close_matchup",
            NotificationType::MatchupWon => "matchup_won",
            NotificationType::MatchupLost => "matchup_lost",
            NotificationType::WeeklyRecap => "weekly_recap",
            NotificationType::DraftPick => "draft_pick",
            NotificationType::BreakingNews => "breaking_news",
            NotificationType::LeagueMessage => "league_message",
            NotificationType::AchievementUnlocked => "achievement_unlocked",
            NotificationType::SystemMaintenance => "system_maintenance",
            NotificationType::Custom => "custom",
        }
    }

    /// Kinds that only matter while games are being played.
    pub fn is_game_sensitive(self) -> bool {
        matches!(
            self,
            NotificationType::GameStart
                | NotificationType::ScoreUpdate
                | NotificationType::CloseMatchup
                | NotificationType::LineupReminder
                | NotificationType::PlayerInjury
        )
    }
}

/// Priority tiers, totally ordered. `Ord` follows declaration order, so
/// `Critical > Urgent > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    /// Numeric ordering weight used by the queue.
    pub fn weight(self) -> u32 {
        match self {
            Priority::Critical => 100,
            Priority::Urgent => 80,
            Priority::High => 60,
            Priority::Normal => 40,
            Priority::Low => 20,
        }
    }

    /// All tiers in descending weight order (queue scan order).
    pub const DESCENDING: [Priority; 5] = [
        Priority::Critical,
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

/// A delivery medium with its own adapter and failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    Sms,
    Socket,
    InApp,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Socket => "socket",
            Channel::InApp => "in_app",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a notification. `Blocked` records an admission
/// decline (terminal, with a reason); `Sent` is a partial delivery where
/// at least one channel succeeded and at least one failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Delivered,
    Sent,
    Failed,
    Expired,
    Blocked,
    Read,
}

impl NotificationStatus {
    /// Terminal states accept no further delivery work.
    pub fn is_terminal(self) -> bool {
        !matches!(self, NotificationStatus::Pending | NotificationStatus::Queued)
    }
}

/// Typed context keys a notification can reference. Replaces a free-form
/// metadata bag: every key the delivery core reads is named here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub league_id: Option<String>,
    pub team_id: Option<String>,
    pub player_id: Option<String>,
    pub game_id: Option<String>,
}

/// Renderable content of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub title: String,
    pub message: String,
    /// Condensed form for SMS and other length-limited channels.
    pub short_message: Option<String>,
    pub action_url: Option<String>,
    #[serde(default)]
    pub context: EventContext,
}

impl Payload {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            short_message: None,
            action_url: None,
            context: EventContext::default(),
        }
    }
}

/// Retry/fallback bookkeeping accumulated over a notification's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMeta {
    /// Completed full delivery cycles that ended in failure and were re-queued.
    pub redeliveries: u32,
    pub fallback_used: bool,
    pub last_error: Option<String>,
}

/// Core notification domain type. Owned by the engine once created; the
/// queue and orchestrator operate on clones/references and never fork the
/// lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationType,
    pub priority: Priority,
    pub user_id: String,
    pub channels: Vec<Channel>,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: DeliveryMeta,
}

impl Notification {
    /// Generate a new time-ordered notification ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }

    /// The instant this notification becomes eligible for delivery.
    pub fn effective_schedule(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Caller-facing input for `Engine::create`. The engine assigns the id,
/// timestamps and status.
#[derive(Debug, Clone, Deserialize)]
pub struct NewNotification {
    pub kind: NotificationType,
    pub priority: Priority,
    pub user_id: String,
    pub channels: Vec<Channel>,
    pub payload: Payload,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewNotification {
    pub(crate) fn into_notification(self, now: DateTime<Utc>) -> Notification {
        Notification {
            id: Notification::new_id(),
            kind: self.kind,
            priority: self.priority,
            user_id: self.user_id,
            channels: self.channels,
            payload: self.payload,
            created_at: now,
            scheduled_at: self.scheduled_at,
            expires_at: self.expires_at,
            meta: DeliveryMeta::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ord_follows_weight() {
        assert!(Priority::Critical > Priority::Urgent);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        let mut weights: Vec<u32> = Priority::DESCENDING.iter().map(|p| p.weight()).collect();
        let sorted = weights.clone();
        weights.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(weights, sorted, "DESCENDING must be sorted by weight desc");
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let mut n = NewNotification {
            kind: NotificationType::ScoreUpdate,
            priority: Priority::Normal,
            user_id: "u1".into(),
            channels: vec![Channel::Push],
            payload: Payload::new("t", "m"),
            scheduled_at: None,
            expires_at: Some(now - chrono::Duration::seconds(1)),
        }
        .into_notification(now);
        assert!(n.is_expired(now));
        n.expires_at = None;
        assert!(!n.is_expired(now));
    }

    #[test]
    fn ids_are_time_ordered() {
        let a = Notification::new_id();
        let b = Notification::new_id();
        assert!(a < b || a.get_timestamp() == b.get_timestamp());
    }

    #[test]
    fn serde_round_trip() {
        let n = NewNotification {
            kind: NotificationType::TradeProposal,
            priority: Priority::High,
            user_id: "u9".into(),
            channels: vec![Channel::Push, Channel::Email],
            payload: Payload::new("Trade offer", "You received a trade offer"),
            scheduled_at: None,
            expires_at: None,
        }
        .into_notification(Utc::now());

        let json = serde_json::to_string(&n).unwrap();
        let back: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(n, back);
    }
}
