//! Worker implementation for processing jobs.

use markup_log::{Instrument, debug, error, info, info_span, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::handler::{JobContext, JobHandler, ProgressReporter};
use crate::job::{FailureOutcome, Job, JobState};
use crate::queue::Queue;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of jobs processed at the same time
    pub concurrency: usize,

    /// Poll interval for checking due jobs
    pub poll_interval: Duration,

    /// Recover jobs left active by a previous process on start
    pub recover_stalled: bool,
}

impl WorkerConfig {
    /// Set the concurrency. Values below 1 are raised to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable stalled job recovery on start.
    pub fn with_recover_stalled(mut self, recover: bool) -> Self {
        self.recover_stalled = recover;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            recover_stalled: true,
        }
    }
}

/// Worker for processing jobs from a queue.
pub struct Worker {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a new worker.
    pub fn new(queue: Queue, handler: impl JobHandler) -> Self {
        Self::with_config(queue, handler, WorkerConfig::default())
    }

    /// Create a worker with custom configuration.
    pub fn with_config(queue: Queue, handler: impl JobHandler, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            shutdown: None,
            handle: None,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Claim one due job and run it to completion.
    ///
    /// Returns `false` when nothing was due. Ignores the pause flag.
    pub async fn process_next(&self) -> QueueResult<bool> {
        let now = self.queue.clock().now();
        match self.queue.store().claim_next(now).await? {
            Some(job) => {
                execute(&self.queue, &self.handler, job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Put jobs left active by a dead process back in line.
    ///
    /// A stalled job counts as a failed attempt: it is retried immediately
    /// if it has attempts left and fails otherwise. Only safe while no other
    /// worker is processing the queue.
    pub async fn recover_stalled(&self) -> QueueResult<usize> {
        let queue = &self.queue;
        let stalled = queue.store().list(JobState::Active, 0, usize::MAX).await?;
        let mut recovered = 0;

        for mut job in stalled {
            let now = queue.clock().now();
            let outcome = job.fail("job stalled while active", Duration::ZERO, now);
            job.promote(now);
            if !queue.store().save_if_current(&job).await? {
                continue;
            }
            recovered += 1;

            let requeued = matches!(outcome, FailureOutcome::Retry(_));
            warn!(
                job_id = %job.id,
                attempts = job.attempts_made,
                requeued,
                "Recovered stalled job"
            );
            queue.events().emit(QueueEvent::Stalled {
                job_id: job.id,
                requeued,
            });
        }

        if recovered > 0 {
            queue.wake().notify_one();
        }
        Ok(recovered)
    }

    /// Start the worker loop in the background.
    pub async fn start(&mut self) -> QueueResult<()> {
        if self.is_running() {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        if self.config.recover_stalled {
            self.recover_stalled().await?;
        }

        info!(
            queue = %self.queue.config().queue_name,
            concurrency = self.config.concurrency,
            "Starting worker"
        );

        let (tx, rx) = watch::channel(false);
        let queue = self.queue.clone();
        let handler = self.handler.clone();
        let config = self.config.clone();
        self.handle = Some(tokio::spawn(run_loop(queue, handler, config, rx)));
        self.shutdown = Some(tx);
        Ok(())
    }

    /// Stop claiming jobs and wait for running ones to finish.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let (Some(tx), Some(handle)) = (self.shutdown.take(), self.handle.take()) else {
            return Err(QueueError::WorkerNotRunning);
        };

        info!("Stopping worker...");
        let _ = tx.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "Worker loop ended abnormally");
        }
        info!("Worker stopped");
        Ok(())
    }

    /// Check if the worker is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

async fn run_loop(
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let concurrency = config.concurrency.max(1);
    let slots = Arc::new(Semaphore::new(concurrency));

    loop {
        if stopping(&shutdown) {
            break;
        }

        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => continue,
        };

        // Read after a slot frees up, so a pause issued mid-job holds the next claim.
        match queue.is_paused().await {
            Ok(false) => {}
            Ok(true) => {
                drop(permit);
                idle(&queue, &config, &mut shutdown).await;
                continue;
            }
            Err(e) => {
                drop(permit);
                error!(error = %e, "Could not read pause flag");
                idle(&queue, &config, &mut shutdown).await;
                continue;
            }
        }

        match queue.store().claim_next(queue.clock().now()).await {
            Ok(Some(job)) => {
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = execute(&queue, &handler, job).await {
                        error!(error = %e, "Could not record job outcome");
                    }
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                idle(&queue, &config, &mut shutdown).await;
            }
            Err(e) => {
                drop(permit);
                error!(error = %e, "Error claiming job");
                idle(&queue, &config, &mut shutdown).await;
            }
        }
    }

    debug!("Waiting for running jobs to finish");
    let _ = slots.acquire_many(concurrency as u32).await;
}

/// Shutdown was requested, or the worker handle was dropped.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn idle(queue: &Queue, config: &WorkerConfig, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(config.poll_interval) => {}
        _ = queue.wake().notified() => {}
        _ = shutdown.changed() => {}
    }
}

/// Run the handler for a claimed job and record the outcome.
async fn execute(queue: &Queue, handler: &Arc<dyn JobHandler>, job: Job) -> QueueResult<()> {
    let span = info_span!("job", job_id = %job.id, attempt = job.attempts_made);
    run_job(queue, handler, job).instrument(span).await
}

async fn run_job(queue: &Queue, handler: &Arc<dyn JobHandler>, mut job: Job) -> QueueResult<()> {
    info!(key = %job.resource_key, max_attempts = job.max_attempts, "Processing job");
    queue.events().emit(QueueEvent::Active {
        job_id: job.id,
        attempt: job.attempts_made,
    });

    let reporter = ProgressReporter::new(
        queue.store().clone(),
        queue.events().clone(),
        job.id,
        job.token,
    );
    let ctx = JobContext::new(job.clone(), reporter);
    let handler = handler.clone();

    // A panicking handler only takes down its own task.
    let outcome = match tokio::spawn(async move { handler.handle(ctx).await }).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) if e.is_panic() => Err("handler panicked".to_string()),
        Err(e) => Err(e.to_string()),
    };

    let now = queue.clock().now();
    match outcome {
        Ok(result) => {
            job.complete(result.clone(), now);
            if !queue.store().save_if_current(&job).await? {
                return discard(&job);
            }
            info!("Job completed");
            queue.events().emit(QueueEvent::Completed {
                job_id: job.id,
                attempts_made: job.attempts_made,
                result,
            });
            retain(queue, JobState::Completed).await;
        }
        Err(reason) => {
            let outcome = job.fail(reason.clone(), queue.config().retry_delay, now);
            if !queue.store().save_if_current(&job).await? {
                return discard(&job);
            }
            match outcome {
                FailureOutcome::Retry(retry_at) => {
                    warn!(
                        error = %reason,
                        attempts = job.attempts_made,
                        retry_at = %retry_at,
                        "Job failed, will retry"
                    );
                    queue.events().emit(QueueEvent::Retrying {
                        job_id: job.id,
                        attempts_made: job.attempts_made,
                        max_attempts: job.max_attempts,
                        error: reason,
                        retry_at,
                    });
                }
                FailureOutcome::Terminal => {
                    error!(error = %reason, attempts = job.attempts_made, "Job failed permanently");
                    queue.events().emit(QueueEvent::Failed {
                        job_id: job.id,
                        attempts_made: job.attempts_made,
                        max_attempts: job.max_attempts,
                        error: reason,
                    });
                    retain(queue, JobState::Failed).await;
                }
            }
        }
    }
    Ok(())
}

fn discard(job: &Job) -> QueueResult<()> {
    info!(
        key = %job.resource_key,
        "Job was replaced or removed while running; outcome discarded"
    );
    Ok(())
}

async fn retain(queue: &Queue, state: JobState) {
    if let Err(e) = queue.apply_retention_for(state).await {
        warn!(error = %e, state = %state, "Retention pass failed");
    }
}
