//! Debounced job queue for markup-sync.
//!
//! Collapses bursts of change notifications for the same resource into a
//! single delayed job and runs it once the burst settles:
//! - ⏳ Debounce by replacement: one job per resource key
//! - 🔁 Fixed-delay retries with a bounded attempt budget
//! - 👷 A single background worker with configurable concurrency
//! - 📦 In-memory or Redis-backed storage
//! - 📊 Progress tracking, lifecycle events and retention
//!
//! ## Debouncing
//!
//! ```
//! use markup_queue::{Clock, MemoryStore, Queue};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), markup_queue::QueueError> {
//! let clock = Clock::manual(chrono::Utc::now());
//! let queue = Queue::new(MemoryStore::new()).with_clock(clock.clone());
//!
//! let first = queue.submit("https://example.com/a", json!({})).await?;
//! clock.advance(Duration::from_secs(60));
//! let second = queue.submit("https://example.com/a", json!({})).await?;
//!
//! // Same job, pushed back by the resubmission.
//! assert_eq!(first.job_id, second.job_id);
//! assert!(second.will_run_at > first.will_run_at);
//! assert_eq!(queue.stats().await?.total, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Queue Configuration
//!
//! ```
//! use markup_queue::{QueueConfig, RetentionPolicy};
//! use std::time::Duration;
//!
//! let config = QueueConfig::new("markup-sync")
//!     .with_debounce_delay(Duration::from_secs(30))
//!     .with_retry_delay(Duration::from_secs(120))
//!     .with_max_attempts(5)
//!     .with_failed_retention(RetentionPolicy::new(Duration::from_secs(86400), 50));
//!
//! assert_eq!(config.max_attempts, 5);
//! assert_eq!(config.failed_retention.max_count, 50);
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use markup_queue::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let store = RedisStore::connect(RedisStoreConfig::new(
//!         "redis://localhost:6379",
//!         "markup-sync",
//!     ))
//!     .await?;
//!     let queue = Queue::new(store);
//!
//!     queue
//!         .submit_url("https://example.com/page", serde_json::json!({"force": true}))
//!         .await?;
//!
//!     let mut worker = Worker::new(queue, |ctx: JobContext| async move {
//!         ctx.report_progress(50).await;
//!         Ok::<_, HandlerError>(serde_json::json!({ "url": ctx.url() }))
//!     });
//!     worker.start().await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     worker.stop().await
//! }
//! ```

pub mod clock;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod queue;
pub mod store;
pub mod worker;

pub use clock::Clock;
pub use error::{HandlerError, QueueError, QueueResult};
pub use events::{EventEmitter, QueueEvent};
pub use handler::{HandlerResult, JobContext, JobHandler, ProgressReporter};
pub use job::{FailureOutcome, Job, JobData, JobId, JobState, JobSummary, job_id_for};
pub use queue::{CleanReport, Queue, QueueConfig, RetentionPolicy, Submission};
pub use store::{JobCounts, JobStore, MemoryStore};
#[cfg(feature = "redis")]
pub use store::{RedisStore, RedisStoreConfig};
pub use worker::{Worker, WorkerConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{HandlerError, QueueError, QueueResult};
    pub use crate::handler::{HandlerResult, JobContext, JobHandler};
    pub use crate::job::{Job, JobData, JobId, JobState};
    pub use crate::queue::{Queue, QueueConfig, Submission};
    pub use crate::store::{JobStore, MemoryStore};
    pub use crate::worker::{Worker, WorkerConfig};
}
