//! Persistent job storage.
//!
//! The queue and worker own every state transition; a store only has to
//! persist records, keep them indexed by state, and make the claim of a
//! waiting job exclusive.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueResult;
use crate::job::{Job, JobId, JobState};

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub total: usize,
}

impl JobCounts {
    /// Add to a single state's count, keeping `total` in step.
    pub fn add(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Delayed => self.delayed += n,
            JobState::Waiting => self.waiting += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
        }
        self.total += n;
    }
}

/// Backend-agnostic job storage.
///
/// Records are keyed by [`JobId`]; there is never more than one record per
/// id. Each record carries an insertion `token`, and writes that report the
/// outcome of a run go through [`JobStore::save_if_current`] so a run whose
/// record was replaced or removed meanwhile cannot clobber the newer one.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Insert a job, overwriting any record with the same id.
    ///
    /// Returns the record that was displaced.
    async fn replace(&self, job: &Job) -> QueueResult<Option<Job>>;

    /// Overwrite the stored record only if it still carries `job.token`.
    ///
    /// Returns `false` when the record was removed or replaced.
    async fn save_if_current(&self, job: &Job) -> QueueResult<bool>;

    /// Delete a job regardless of state. Returns the deleted record.
    async fn remove(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Set the progress of a running job.
    ///
    /// Applies only while the stored record is active and still carries
    /// `token`, so a late report can never rewrite a finished run.
    async fn record_progress(&self, id: JobId, token: Uuid, progress: u8) -> QueueResult<bool>;

    /// Move delayed jobs whose `run_at` has passed to waiting.
    async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<usize>;

    /// Atomically claim the earliest waiting job.
    ///
    /// The implementation must mark the job active via
    /// [`Job::start_processing`] and guarantee that no other caller can
    /// claim the same job. Returns `None` when nothing is waiting.
    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Count jobs per state.
    async fn counts(&self) -> QueueResult<JobCounts>;

    /// Jobs in `state`, positions `start..=end`.
    ///
    /// Pending states are ordered by `run_at` ascending, active jobs by start
    /// time and terminal states most recent first.
    async fn list(&self, state: JobState, start: usize, end: usize) -> QueueResult<Vec<Job>>;

    /// Delete up to `limit` jobs in a terminal `state` that finished before `cutoff`.
    async fn clean(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<JobId>>;

    /// Delete the oldest jobs in a terminal `state` beyond the newest `keep`.
    async fn trim(&self, state: JobState, keep: usize) -> QueueResult<Vec<JobId>>;

    /// Set the global pause flag.
    async fn set_paused(&self, paused: bool) -> QueueResult<()>;

    /// Read the global pause flag.
    async fn is_paused(&self) -> QueueResult<bool>;
}

/// Reject pruning requests aimed at pending states.
pub(crate) fn ensure_terminal(state: JobState) -> QueueResult<()> {
    if state.is_terminal() {
        Ok(())
    } else {
        Err(crate::error::QueueError::InvalidInput(format!(
            "only completed or failed jobs can be pruned, got {state}"
        )))
    }
}
