mod json;
mod memory;
mod traits;

pub use json::JsonFileStore;
pub use memory::MemoryStore;
pub use traits::{QueueStore, QueueRecord};
