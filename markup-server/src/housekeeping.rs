//! Periodic retention pass.

use markup_log::{debug, info, warn};
use markup_queue::Queue;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Applies the queue's retention policies on a fixed interval.
pub struct Housekeeper {
    queue: Queue,
    interval: Duration,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn new(queue: Queue, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            shutdown: None,
            handle: None,
        }
    }

    /// Start the background task. The first pass runs immediately.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Housekeeping already running");
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let queue = self.queue.clone();
        let period = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.apply_retention().await {
                            Ok(report) if report.total() > 0 => info!(
                                completed = report.cleaned_completed,
                                failed = report.cleaned_failed,
                                "Housekeeping removed expired jobs"
                            ),
                            Ok(_) => debug!("Housekeeping found nothing to remove"),
                            Err(e) => warn!(error = %e, "Housekeeping pass failed"),
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        }));
        self.shutdown = Some(tx);
        info!(interval_secs = period.as_secs(), "Housekeeping started");
    }

    /// Stop the task, letting a pass in progress finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Housekeeping task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use markup_queue::{Clock, MemoryStore, QueueConfig, RetentionPolicy, Worker};
    use markup_queue::{HandlerError, JobContext};
    use serde_json::json;

    #[tokio::test]
    async fn test_housekeeping_applies_retention() {
        let clock = Clock::manual(chrono::Utc::now());
        let config = QueueConfig::default()
            .with_completed_retention(RetentionPolicy::new(Duration::from_secs(60), 100));
        let queue = Queue::with_config(MemoryStore::new(), config).with_clock(clock.clone());

        let worker = Worker::new(queue.clone(), |_ctx: JobContext| async {
            Ok::<_, HandlerError>(json!(null))
        });
        queue
            .submit_with_delay("k", json!({}), Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(worker.process_next().await.unwrap());
        assert_eq!(queue.stats().await.unwrap().completed, 1);

        clock.advance(Duration::from_secs(120));
        let mut housekeeper = Housekeeper::new(queue.clone(), Duration::from_secs(3600));
        housekeeper.start();
        assert!(housekeeper.is_running());

        let mut cleaned = false;
        for _ in 0..100 {
            if queue.stats().await.unwrap().completed == 0 {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        housekeeper.stop().await;

        assert!(cleaned);
        assert!(!housekeeper.is_running());
    }
}
