//! Job handlers.

use async_trait::async_trait;
use markup_log::debug;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{HandlerError, QueueResult};
use crate::events::{EventEmitter, QueueEvent};
use crate::job::{Job, JobData, JobId};
use crate::store::JobStore;

/// Outcome of a handler run: the job result, or the reason it failed.
pub type HandlerResult = Result<JobData, HandlerError>;

/// Processes one job at a time.
///
/// Closures of the form `Fn(JobContext) -> impl Future<Output = HandlerResult>`
/// implement this trait.
///
/// # Examples
///
/// ```
/// use markup_queue::{HandlerError, JobContext};
/// use serde_json::json;
///
/// let handler = |ctx: JobContext| async move {
///     ctx.report_progress(50).await;
///     Ok::<_, HandlerError>(json!({ "synced": ctx.url() }))
/// };
/// # let _ = handler;
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// What a handler sees of the job it runs.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    progress: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(job: Job, progress: ProgressReporter) -> Self {
        Self { job, progress }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn payload(&self) -> &JobData {
        &self.job.payload
    }

    /// The `url` field of the payload, if it has one.
    pub fn url(&self) -> Option<&str> {
        self.job.payload.get("url").and_then(|v| v.as_str())
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    /// Record progress (0-100). Failures to persist are logged, not returned.
    pub async fn report_progress(&self, progress: u8) {
        if let Err(e) = self.progress.report(progress).await {
            debug!(job_id = %self.job.id, error = %e, "Could not record progress");
        }
    }

    pub fn progress_reporter(&self) -> ProgressReporter {
        self.progress.clone()
    }
}

/// Records progress for a single run of a job.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    events: EventEmitter,
    job_id: JobId,
    token: Uuid,
}

impl ProgressReporter {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        events: EventEmitter,
        job_id: JobId,
        token: Uuid,
    ) -> Self {
        Self {
            store,
            events,
            job_id,
            token,
        }
    }

    /// Store `progress` on the job, unless the run has been superseded.
    ///
    /// Returns whether the progress was recorded.
    pub async fn report(&self, progress: u8) -> QueueResult<bool> {
        let progress = progress.min(100);
        let saved = self
            .store
            .record_progress(self.job_id, self.token, progress)
            .await?;
        if saved {
            self.events.emit(QueueEvent::Progress {
                job_id: self.job_id,
                progress,
            });
        }
        Ok(saved)
    }
}
