use crate::notification::Channel;

/// Low-level persistence errors (filesystem, serialization).
/// This is the error type for the `QueueStore` trait — store operations can
/// only fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Synchronous errors surfaced to the caller of `Engine::create`.
/// Everything past admission is handled internally and never reaches here.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("invalid notification: {0}")]
    Validation(String),

    #[error("queue at capacity ({0} entries)")]
    QueueFull(usize),

    #[error("engine is shut down")]
    ShutDown,
}

/// Classification a channel adapter attaches to a failed delivery so the
/// orchestrator can decide whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary provider failure; retry with backoff.
    Transient,
    /// Provider-side rate limit; retry with backoff.
    RateLimited,
    /// The per-attempt timeout elapsed; retryable.
    Timeout,
    /// Recipient unreachable or target invalid; never retried.
    InvalidTarget,
    /// The channel is not usable for this user; never retried.
    Unsupported,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Timeout
        )
    }
}

/// A classified delivery failure reported by a channel adapter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{channel} delivery failed ({kind:?}): {message}")]
pub struct ChannelError {
    pub channel: Channel,
    pub kind: ErrorKind,
    pub message: String,
}

impl ChannelError {
    pub fn new(channel: Channel, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            channel,
            kind,
            message: message.into(),
        }
    }

    pub fn transient(channel: Channel, message: impl Into<String>) -> Self {
        Self::new(channel, ErrorKind::Transient, message)
    }

    pub fn invalid_target(channel: Channel, message: impl Into<String>) -> Self {
        Self::new(channel, ErrorKind::InvalidTarget, message)
    }
}

/// Engine lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error("notification not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("notification {0} does not belong to user {1}")]
    WrongUser(uuid::Uuid, String),

    #[error("adapter initialization failed: {0}")]
    Adapter(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type CreateResult<T> = std::result::Result<T, CreateError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;
