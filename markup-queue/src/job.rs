//! Job definition and state management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::checked_add;
use crate::error::QueueError;

/// Job identifier, derived from the resource key.
pub type JobId = Uuid;

/// Job payload data.
pub type JobData = serde_json::Value;

/// Deterministic job id for a resource key.
///
/// Every submission for the same key maps to the same id, so a new
/// submission collides with whatever record already exists for it.
pub fn job_id_for(resource_key: &str) -> JobId {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, resource_key.as_bytes())
}

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for `run_at` to pass
    Delayed,
    /// Due and ready to be claimed
    Waiting,
    /// Claimed by the worker; handler running
    Active,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted
    Failed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Delayed,
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    /// Whether no further automatic transition happens from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delayed" => Ok(JobState::Delayed),
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(QueueError::InvalidInput(format!("unknown job state: {other}"))),
        }
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-delayed until the given instant
    Retry(DateTime<Utc>),
    /// Attempts exhausted
    Terminal,
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job identifier
    pub id: JobId,

    /// Logical dedup key (the target URL)
    pub resource_key: String,

    /// Data forwarded verbatim to the handler
    pub payload: JobData,

    /// Current state
    pub state: JobState,

    /// Handler invocations so far
    pub attempts_made: u32,

    /// Invocations allowed before terminal failure
    pub max_attempts: u32,

    /// Not claimed before this instant
    pub run_at: DateTime<Utc>,

    /// Last reported progress (0-100)
    pub progress: u8,

    /// Handler result once completed
    pub result: Option<JobData>,

    /// Last handler error
    pub failure_reason: Option<String>,

    /// Identifies this insertion; outcomes of a replaced run are discarded
    pub token: Uuid,

    /// When the job was submitted
    pub created_at: DateTime<Utc>,

    /// When the current or last attempt started
    pub processed_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a delayed job for `resource_key`, eligible at `run_at`.
    pub fn new(
        resource_key: impl Into<String>,
        payload: JobData,
        max_attempts: u32,
        now: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Self {
        let resource_key = resource_key.into();
        Self {
            id: job_id_for(&resource_key),
            resource_key,
            payload,
            state: JobState::Delayed,
            attempts_made: 0,
            max_attempts,
            run_at,
            progress: 0,
            result: None,
            failure_reason: None,
            token: Uuid::new_v4(),
            created_at: now,
            processed_at: None,
            finished_at: None,
        }
    }

    /// Whether `run_at` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.run_at
    }

    /// Whether another failed attempt would be re-delayed.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Delayed -> waiting once due. Returns whether the state changed.
    pub fn promote(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == JobState::Delayed && self.is_due(now) {
            self.state = JobState::Waiting;
            true
        } else {
            false
        }
    }

    /// Mark the job as claimed and count the attempt.
    ///
    /// A job that was manually retried after exhausting its attempts starts
    /// a fresh attempt budget.
    pub fn start_processing(&mut self, now: DateTime<Utc>) {
        if self.attempts_made >= self.max_attempts {
            self.attempts_made = 0;
        }
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.progress = 0;
        self.processed_at = Some(now);
    }

    /// Mark the job as completed.
    pub fn complete(&mut self, result: JobData, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.result = Some(result);
        self.progress = 100;
        self.finished_at = Some(now);
    }

    /// Record a failed attempt: re-delay by `retry_delay`, or fail for good.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.failure_reason = Some(error.into());
        // A retry that cannot be placed on the calendar is terminal.
        let retry_at = self
            .can_retry()
            .then(|| checked_add(now, retry_delay))
            .flatten();
        match retry_at {
            Some(run_at) => {
                self.state = JobState::Delayed;
                self.run_at = run_at;
                FailureOutcome::Retry(run_at)
            }
            None => {
                self.state = JobState::Failed;
                self.finished_at = Some(now);
                FailureOutcome::Terminal
            }
        }
    }

    /// Make the job eligible immediately, whatever its state.
    ///
    /// The job gets a new token, so a run still in flight for the old one
    /// can no longer record its outcome.
    pub fn retry_now(&mut self, now: DateTime<Utc>) {
        self.token = Uuid::new_v4();
        self.state = JobState::Delayed;
        self.run_at = now;
        self.result = None;
        self.finished_at = None;
    }

    /// Update job progress.
    pub fn update_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    /// Timestamp the job is ordered by within its state.
    pub fn index_time(&self) -> DateTime<Utc> {
        match self.state {
            JobState::Delayed | JobState::Waiting => self.run_at,
            JobState::Active => self.processed_at.unwrap_or(self.run_at),
            JobState::Completed | JobState::Failed => self.finished_at.unwrap_or(self.run_at),
        }
    }

    /// Listing view of the job.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            resource_key: self.resource_key.clone(),
            state: self.state,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            progress: self.progress,
            run_at: self.run_at,
            finished_at: self.finished_at,
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// Condensed job view used by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub resource_key: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub run_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}
