//! Lifecycle notifications.
//!
//! Every state change the queue or worker makes is published on a broadcast
//! channel. Slow subscribers lag and lose events; they never slow the worker.

use chrono::{DateTime, Utc};
use markup_log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{JobData, JobId, JobState};

/// A queue lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    /// A job was (re)submitted; `replaced` is the state of the record it displaced.
    Delayed {
        job_id: JobId,
        run_at: DateTime<Utc>,
        replaced: Option<JobState>,
    },
    /// The worker claimed a job.
    Active { job_id: JobId, attempt: u32 },
    /// The handler reported progress.
    Progress { job_id: JobId, progress: u8 },
    /// The handler succeeded.
    Completed {
        job_id: JobId,
        attempts_made: u32,
        result: JobData,
    },
    /// The handler failed and the job was re-delayed.
    Retrying {
        job_id: JobId,
        attempts_made: u32,
        max_attempts: u32,
        error: String,
        retry_at: DateTime<Utc>,
    },
    /// The handler failed and the job is out of attempts.
    Failed {
        job_id: JobId,
        attempts_made: u32,
        max_attempts: u32,
        error: String,
    },
    /// An operator made a job eligible immediately.
    RetryScheduled { job_id: JobId },
    /// A job record was deleted.
    Removed { job_id: JobId, state: JobState },
    /// A job left active by a previous worker was recovered.
    Stalled { job_id: JobId, requeued: bool },
    /// Terminal jobs were pruned.
    Cleaned { completed: usize, failed: usize },
    /// Processing was paused.
    Paused,
    /// Processing was resumed.
    Resumed,
}

impl QueueEvent {
    /// Event name as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Delayed { .. } => "delayed",
            QueueEvent::Active { .. } => "active",
            QueueEvent::Progress { .. } => "progress",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Retrying { .. } => "retrying",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::RetryScheduled { .. } => "retryScheduled",
            QueueEvent::Removed { .. } => "removed",
            QueueEvent::Stalled { .. } => "stalled",
            QueueEvent::Cleaned { .. } => "cleaned",
            QueueEvent::Paused => "paused",
            QueueEvent::Resumed => "resumed",
        }
    }

    /// Job the event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::Delayed { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Retrying { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::RetryScheduled { job_id }
            | QueueEvent::Removed { job_id, .. }
            | QueueEvent::Stalled { job_id, .. } => Some(*job_id),
            QueueEvent::Cleaned { .. } | QueueEvent::Paused | QueueEvent::Resumed => None,
        }
    }
}

/// Broadcast sender shared by the queue and worker.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventEmitter {
    /// Create an emitter buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: QueueEvent) {
        trace!(event = event.name(), job_id = ?event.job_id(), "queue event");
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
