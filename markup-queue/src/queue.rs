//! Debouncing queue front-end.

use chrono::{DateTime, Utc};
use markup_log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

use crate::clock::{Clock, checked_add, checked_sub};
use crate::error::{QueueError, QueueResult};
use crate::events::{EventEmitter, QueueEvent};
use crate::job::{Job, JobData, JobId, JobState, JobSummary, job_id_for};
use crate::store::{JobCounts, JobStore};

/// Jobs removed per store call while cleaning.
const CLEAN_BATCH: usize = 1000;

/// How long terminal jobs are kept around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Jobs that finished longer ago than this are removed
    pub max_age: Duration,

    /// At most this many jobs are kept, newest first
    pub max_count: usize,
}

impl RetentionPolicy {
    pub fn new(max_age: Duration, max_count: usize) -> Self {
        Self { max_age, max_count }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name
    pub queue_name: String,

    /// Delay applied to every submission that doesn't specify one
    pub debounce_delay: Duration,

    /// Fixed delay before a failed attempt is retried
    pub retry_delay: Duration,

    /// Handler invocations allowed per job
    pub max_attempts: u32,

    /// Retention for completed jobs
    pub completed_retention: RetentionPolicy,

    /// Retention for failed jobs
    pub failed_retention: RetentionPolicy,

    /// Events buffered per subscriber
    pub event_capacity: usize,
}

impl QueueConfig {
    /// Create a configuration with the default timings.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            debounce_delay: Duration::from_secs(3 * 60),
            retry_delay: Duration::from_secs(10 * 60),
            max_attempts: 3,
            completed_retention: RetentionPolicy::new(Duration::from_secs(24 * 3600), 100),
            failed_retention: RetentionPolicy::new(Duration::from_secs(7 * 24 * 3600), 1000),
            event_capacity: 256,
        }
    }

    /// Set the debounce delay.
    pub fn with_debounce_delay(mut self, delay: Duration) -> Self {
        self.debounce_delay = delay;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the attempt budget. Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the retention for completed jobs.
    pub fn with_completed_retention(mut self, policy: RetentionPolicy) -> Self {
        self.completed_retention = policy;
        self
    }

    /// Set the retention for failed jobs.
    pub fn with_failed_retention(mut self, policy: RetentionPolicy) -> Self {
        self.failed_retention = policy;
        self
    }

    /// Set the per-subscriber event buffer.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    fn retention(&self, state: JobState) -> RetentionPolicy {
        if state == JobState::Failed {
            self.failed_retention
        } else {
            self.completed_retention
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("markup-sync")
    }
}

/// Acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub job_id: JobId,
    pub status: JobState,
    pub will_run_at: DateTime<Utc>,
}

/// Number of terminal jobs removed by a cleaning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    pub cleaned_completed: usize,
    pub cleaned_failed: usize,
}

impl CleanReport {
    pub fn total(&self) -> usize {
        self.cleaned_completed + self.cleaned_failed
    }

    fn add(&mut self, state: JobState, n: usize) {
        if state == JobState::Failed {
            self.cleaned_failed += n;
        } else {
            self.cleaned_completed += n;
        }
    }
}

/// A debouncing job queue.
///
/// At most one job exists per resource key. Submitting a key that already
/// has a job replaces that job and restarts its delay, so a burst of
/// submissions collapses into a single run after the burst settles.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    clock: Clock,
    events: EventEmitter,
    wake: Arc<Notify>,
}

impl Queue {
    /// Create a queue over `store` with the default configuration.
    pub fn new(store: impl JobStore) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    /// Create a queue with custom configuration.
    pub fn with_config(store: impl JobStore, config: QueueConfig) -> Self {
        Self::from_store(Arc::new(store), config)
    }

    /// Create a queue over an already shared store.
    pub fn from_store(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        info!(
            queue = %config.queue_name,
            debounce_ms = config.debounce_delay.as_millis() as u64,
            retry_ms = config.retry_delay.as_millis() as u64,
            max_attempts = config.max_attempts,
            "Job queue ready"
        );
        let events = EventEmitter::new(config.event_capacity);
        Self {
            store,
            config,
            clock: Clock::system(),
            events,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub(crate) fn wake(&self) -> &Arc<Notify> {
        &self.wake
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Submit work for `resource_key` after the default debounce delay.
    pub async fn submit(
        &self,
        resource_key: impl Into<String>,
        payload: JobData,
    ) -> QueueResult<Submission> {
        self.submit_with_delay(resource_key, payload, None).await
    }

    /// Submit work for `resource_key`, replacing any job it already has.
    ///
    /// The replaced job is dropped whatever its state. If it was running, the
    /// run continues but its outcome is discarded.
    pub async fn submit_with_delay(
        &self,
        resource_key: impl Into<String>,
        payload: JobData,
        delay: Option<Duration>,
    ) -> QueueResult<Submission> {
        let resource_key = resource_key.into();
        if resource_key.trim().is_empty() {
            return Err(QueueError::InvalidInput(
                "resource key must not be empty".into(),
            ));
        }

        let now = self.clock.now();
        let delay = delay.unwrap_or(self.config.debounce_delay);
        let run_at = checked_add(now, delay).ok_or_else(|| {
            QueueError::InvalidInput(format!("delay of {}ms is out of range", delay.as_millis()))
        })?;
        let job = Job::new(
            resource_key,
            payload,
            self.config.max_attempts,
            now,
            run_at,
        );

        let replaced = self.store.replace(&job).await?.map(|previous| previous.state);
        match replaced {
            Some(JobState::Active) => warn!(
                job_id = %job.id,
                key = %job.resource_key,
                "Replaced a running job; its outcome will be discarded"
            ),
            Some(state) => debug!(job_id = %job.id, key = %job.resource_key, replaced = %state, "Debounced submission"),
            None => debug!(job_id = %job.id, key = %job.resource_key, "Submitted job"),
        }

        self.events.emit(QueueEvent::Delayed {
            job_id: job.id,
            run_at,
            replaced,
        });
        if delay.is_zero() {
            self.wake.notify_one();
        }

        Ok(Submission {
            job_id: job.id,
            status: job.state,
            will_run_at: run_at,
        })
    }

    /// Submit a page sync for `url`, keyed by the URL itself.
    ///
    /// The handler receives `{"url": url, "options": options}`.
    pub async fn submit_url(&self, url: &str, options: JobData) -> QueueResult<Submission> {
        let options = if options.is_null() {
            serde_json::json!({})
        } else {
            options
        };
        let payload = serde_json::json!({ "url": url, "options": options });
        self.submit(url, payload).await
    }

    /// Job id a submission for `resource_key` would get.
    pub fn job_id(&self, resource_key: &str) -> JobId {
        job_id_for(resource_key)
    }

    /// Count jobs per state.
    pub async fn stats(&self) -> QueueResult<JobCounts> {
        self.store.promote_due(self.clock.now()).await?;
        self.store.counts().await
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.store.get(id).await
    }

    /// Summaries of jobs in `state`, positions `start..=end`.
    pub async fn list_jobs(
        &self,
        state: JobState,
        start: usize,
        end: usize,
    ) -> QueueResult<Vec<JobSummary>> {
        if matches!(state, JobState::Delayed | JobState::Waiting) {
            self.store.promote_due(self.clock.now()).await?;
        }
        let jobs = self.store.list(state, start, end).await?;
        Ok(jobs.iter().map(Job::summary).collect())
    }

    /// Make a job eligible immediately, whatever its state.
    ///
    /// The attempt count is left alone.
    pub async fn retry_now(&self, id: JobId) -> QueueResult<Job> {
        let mut job = self.store.get(id).await?.ok_or(QueueError::JobNotFound(id))?;
        let previous = job.state;

        job.retry_now(self.clock.now());
        self.store.replace(&job).await?;
        info!(job_id = %id, previous = %previous, "Job scheduled for immediate retry");

        self.events.emit(QueueEvent::RetryScheduled { job_id: id });
        self.wake.notify_one();
        Ok(job)
    }

    /// Delete a job whatever its state.
    ///
    /// Removing a running job does not stop it, but its outcome is discarded.
    pub async fn remove(&self, id: JobId) -> QueueResult<Job> {
        let job = self.store.remove(id).await?.ok_or(QueueError::JobNotFound(id))?;
        info!(job_id = %id, state = %job.state, "Job removed");
        self.events.emit(QueueEvent::Removed {
            job_id: id,
            state: job.state,
        });
        Ok(job)
    }

    /// Stop claiming new jobs. Running jobs finish.
    pub async fn pause(&self) -> QueueResult<()> {
        self.store.set_paused(true).await?;
        info!(queue = %self.config.queue_name, "Queue paused");
        self.events.emit(QueueEvent::Paused);
        Ok(())
    }

    /// Resume claiming jobs.
    pub async fn resume(&self) -> QueueResult<()> {
        self.store.set_paused(false).await?;
        info!(queue = %self.config.queue_name, "Queue resumed");
        self.events.emit(QueueEvent::Resumed);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        self.store.is_paused().await
    }

    /// Remove completed and failed jobs that finished more than `grace` ago.
    ///
    /// Pending and running jobs are never touched.
    pub async fn clean(&self, grace: Duration) -> QueueResult<CleanReport> {
        let cutoff = checked_sub(self.clock.now(), grace).ok_or_else(|| {
            QueueError::InvalidInput(format!(
                "grace period of {}ms is out of range",
                grace.as_millis()
            ))
        })?;
        let mut report = CleanReport::default();
        for state in [JobState::Completed, JobState::Failed] {
            report.add(state, self.clean_before(state, cutoff).await?);
        }

        info!(
            completed = report.cleaned_completed,
            failed = report.cleaned_failed,
            "Cleaned terminal jobs"
        );
        self.emit_cleaned(report);
        Ok(report)
    }

    /// Apply both retention policies.
    pub async fn apply_retention(&self) -> QueueResult<CleanReport> {
        let mut report = CleanReport::default();
        for state in [JobState::Completed, JobState::Failed] {
            report.add(state, self.retain(state).await?);
        }
        if report.total() > 0 {
            debug!(
                completed = report.cleaned_completed,
                failed = report.cleaned_failed,
                "Applied retention"
            );
        }
        self.emit_cleaned(report);
        Ok(report)
    }

    /// Apply the retention policy of a single terminal state.
    pub(crate) async fn apply_retention_for(&self, state: JobState) -> QueueResult<usize> {
        let removed = self.retain(state).await?;
        let mut report = CleanReport::default();
        report.add(state, removed);
        self.emit_cleaned(report);
        Ok(removed)
    }

    async fn retain(&self, state: JobState) -> QueueResult<usize> {
        let policy = self.config.retention(state);
        // Nothing can be older than an unrepresentable age.
        let aged = match checked_sub(self.clock.now(), policy.max_age) {
            Some(cutoff) => self.clean_before(state, cutoff).await?,
            None => 0,
        };
        let trimmed = self.store.trim(state, policy.max_count).await?.len();
        Ok(aged + trimmed)
    }

    async fn clean_before(&self, state: JobState, cutoff: DateTime<Utc>) -> QueueResult<usize> {
        let mut removed = 0;
        loop {
            let batch = self.store.clean(state, cutoff, CLEAN_BATCH).await?.len();
            removed += batch;
            if batch < CLEAN_BATCH {
                return Ok(removed);
            }
        }
    }

    fn emit_cleaned(&self, report: CleanReport) {
        if report.total() > 0 {
            self.events.emit(QueueEvent::Cleaned {
                completed: report.cleaned_completed,
                failed: report.cleaned_failed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn queue() -> (Queue, Clock) {
        let clock = Clock::manual(Utc::now());
        let queue = Queue::new(MemoryStore::new()).with_clock(clock.clone());
        (queue, clock)
    }

    async fn finish(queue: &Queue, succeed: bool) -> Job {
        let now = queue.clock().now();
        let mut job = queue.store().claim_next(now).await.unwrap().unwrap();
        if succeed {
            job.complete(json!(true), now);
        } else {
            job.max_attempts = job.attempts_made;
            job.fail("boom", Duration::from_secs(1), now);
        }
        assert!(queue.store().save_if_current(&job).await.unwrap());
        job
    }

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.queue_name, "markup-sync");
        assert_eq!(config.debounce_delay, Duration::from_secs(180));
        assert_eq!(config.retry_delay, Duration::from_secs(600));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.completed_retention.max_count, 100);
        assert_eq!(config.failed_retention.max_count, 1000);
    }

    #[test]
    fn test_queue_config_builder_pattern() {
        let config = QueueConfig::new("test")
            .with_debounce_delay(Duration::from_secs(1))
            .with_retry_delay(Duration::from_secs(2))
            .with_max_attempts(0);

        assert_eq!(config.debounce_delay, Duration::from_secs(1));
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_submit_uses_debounce_delay() {
        let (queue, clock) = queue();
        let now = clock.now();

        let submission = queue.submit("https://a.test/", json!({})).await.unwrap();

        assert_eq!(submission.status, JobState::Delayed);
        assert_eq!(submission.will_run_at, now + chrono::Duration::seconds(180));
        assert_eq!(submission.job_id, queue.job_id("https://a.test/"));
    }

    #[tokio::test]
    async fn test_submit_url_builds_payload() {
        let (queue, _) = queue();
        let submission = queue
            .submit_url("https://a.test/", serde_json::Value::Null)
            .await
            .unwrap();

        let job = queue.get_job(submission.job_id).await.unwrap().unwrap();
        assert_eq!(job.resource_key, "https://a.test/");
        assert_eq!(job.payload, json!({"url": "https://a.test/", "options": {}}));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_key() {
        let (queue, _) = queue();
        let err = queue.submit("  ", json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_durations_are_rejected() {
        let (queue, _) = queue();
        let huge = Duration::from_millis(u64::MAX);

        let err = queue
            .submit_with_delay("k", json!({}), Some(huge))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
        assert_eq!(queue.stats().await.unwrap().total, 0);

        let err = queue.clean(huge).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unbounded_retention_age_keeps_jobs() {
        let clock = Clock::manual(Utc::now());
        let forever = RetentionPolicy::new(Duration::from_millis(u64::MAX), 10);
        let config = QueueConfig::default().with_completed_retention(forever);
        let queue = Queue::with_config(MemoryStore::new(), config).with_clock(clock.clone());

        queue
            .submit_with_delay("k", json!({}), Some(Duration::ZERO))
            .await
            .unwrap();
        finish(&queue, true).await;

        let report = queue.apply_retention().await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_resubmit_replaces_and_emits() {
        let (queue, clock) = queue();
        let mut events = queue.subscribe();

        queue.submit("k", json!({"n": 1})).await.unwrap();
        clock.advance(Duration::from_secs(60));
        queue.submit("k", json!({"n": 2})).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.delayed, 1);

        let job = queue.get_job(queue.job_id("k")).await.unwrap().unwrap();
        assert_eq!(job.payload, json!({"n": 2}));

        let _first = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            QueueEvent::Delayed { replaced, .. } => assert_eq!(replaced, Some(JobState::Delayed)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stats_promote_due_jobs() {
        let (queue, clock) = queue();
        queue
            .submit_with_delay("k", json!({}), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(queue.stats().await.unwrap().delayed, 1);
        clock.advance(Duration::from_secs(5));
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.delayed, 0);
    }

    #[tokio::test]
    async fn test_retry_now_and_remove_missing_job() {
        let (queue, _) = queue();
        let id = queue.job_id("missing");

        assert!(matches!(
            queue.retry_now(id).await,
            Err(QueueError::JobNotFound(_))
        ));
        assert!(matches!(
            queue.remove(id).await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_now_keeps_attempts() {
        let (queue, clock) = queue();
        queue
            .submit_with_delay("k", json!({}), Some(Duration::ZERO))
            .await
            .unwrap();
        let failed = finish(&queue, false).await;

        clock.advance(Duration::from_secs(30));
        let retried = queue.retry_now(failed.id).await.unwrap();

        assert_eq!(retried.state, JobState::Delayed);
        assert_eq!(retried.run_at, clock.now());
        assert_eq!(retried.attempts_made, failed.attempts_made);
    }

    #[tokio::test]
    async fn test_clean_respects_grace_and_state() {
        let (queue, clock) = queue();
        for key in ["done", "broken"] {
            queue
                .submit_with_delay(key, json!({}), Some(Duration::ZERO))
                .await
                .unwrap();
        }
        finish(&queue, true).await;
        finish(&queue, false).await;
        queue.submit("pending", json!({})).await.unwrap();

        let report = queue.clean(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report.total(), 0);

        clock.advance(Duration::from_secs(2 * 3600));
        let report = queue.clean(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report.cleaned_completed, 1);
        assert_eq!(report.cleaned_failed, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.delayed + stats.waiting, 1);
    }

    #[tokio::test]
    async fn test_retention_trims_completed() {
        let clock = Clock::manual(Utc::now());
        let config = QueueConfig::default()
            .with_completed_retention(RetentionPolicy::new(Duration::from_secs(3600), 1));
        let queue = Queue::with_config(MemoryStore::new(), config).with_clock(clock.clone());

        for key in ["a", "b"] {
            queue
                .submit_with_delay(key, json!({}), Some(Duration::ZERO))
                .await
                .unwrap();
            finish(&queue, true).await;
            clock.advance(Duration::from_secs(1));
        }

        let report = queue.apply_retention().await.unwrap();
        assert_eq!(report.cleaned_completed, 1);
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (queue, _) = queue();
        queue.pause().await.unwrap();
        assert!(queue.is_paused().await.unwrap());
        queue.resume().await.unwrap();
        assert!(!queue.is_paused().await.unwrap());
    }
}
