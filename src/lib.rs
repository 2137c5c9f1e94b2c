pub mod engine;
pub mod error;
pub mod notification;
pub mod store;
pub mod telemetry;

pub use engine::admission::{
    AdmissionDecision, BehaviorProfile, NoProfileProvider, Optimizations, ProfileError,
    ProfileProvider,
};
pub use engine::channel::{AttemptContext, ChannelAdapter, DeliveryResult};
pub use engine::config::{
    AdmissionConfig, DeliveryConfig, EngineConfig, PriorityAttempts, QueueConfig, TickConfig,
};
pub use engine::events::{EventKind, NotificationEvent};
pub use engine::stats::{EngineStats, QueueStats};
pub use engine::Engine;
pub use error::{
    ChannelError, CreateError, CreateResult, EngineError, EngineResult, ErrorKind, StoreError,
    StoreResult,
};
pub use notification::{
    Channel, DeliveryMeta, EventContext, NewNotification, Notification, NotificationStatus,
    NotificationType, Payload, Priority,
};
pub use store::{JsonFileStore, MemoryStore, QueueRecord, QueueStore};
