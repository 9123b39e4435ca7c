// markup-sync - debounced page-sync job queue
//
// Coalesces bursts of change notifications per URL into a single delayed
// scrape, retried a bounded number of times on failure.

pub use markup_log;
pub use markup_queue;
pub use markup_server;

pub use markup_queue::{
    Clock, HandlerError, HandlerResult, Job, JobContext, JobHandler, JobId, JobState, MemoryStore,
    Queue, QueueConfig, QueueError, QueueEvent, QueueResult, Worker, WorkerConfig,
};
#[cfg(feature = "redis")]
pub use markup_queue::{RedisStore, RedisStoreConfig};
pub use markup_server::{AppState, CommandHandler, Housekeeper, ServiceConfig, create_router};

/// Re-export commonly used types
pub mod prelude {
    pub use markup_queue::prelude::*;
    pub use markup_server::{AppState, CommandHandler, ServiceConfig};
}
