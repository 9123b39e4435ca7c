use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobCounts, JobStore, ensure_terminal};
use crate::error::QueueResult;
use crate::job::{Job, JobId, JobState};

/// In-memory [`JobStore`] for development and testing.
///
/// Jobs live in a map behind a mutex, which also serializes claims. Not
/// durable: everything is lost on restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
    paused: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_in_state(jobs: &HashMap<JobId, Job>, state: JobState) -> Vec<&Job> {
    let mut selected: Vec<&Job> = jobs.values().filter(|j| j.state == state).collect();
    selected.sort_by_key(|j| (j.index_time(), j.created_at));
    if state.is_terminal() {
        selected.reverse();
    }
    selected
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn replace(&self, job: &Job) -> QueueResult<Option<Job>> {
        Ok(self.jobs.lock().await.insert(job.id, job.clone()))
    }

    async fn save_if_current(&self, job: &Job) -> QueueResult<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.token == job.token => {
                *existing = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.jobs.lock().await.remove(&id))
    }

    async fn record_progress(&self, id: JobId, token: Uuid, progress: u8) -> QueueResult<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Active && job.token == token => {
                job.update_progress(progress);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let mut jobs = self.jobs.lock().await;
        let mut promoted = 0;
        for job in jobs.values_mut() {
            if job.promote(now) {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.values_mut() {
            job.promote(now);
        }

        let next = sorted_in_state(&jobs, JobState::Waiting)
            .first()
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.start_processing(now);
                job.clone()
            })
        }))
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let jobs = self.jobs.lock().await;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn list(&self, state: JobState, start: usize, end: usize) -> QueueResult<Vec<Job>> {
        if end < start {
            return Ok(Vec::new());
        }
        let jobs = self.jobs.lock().await;
        Ok(sorted_in_state(&jobs, state)
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start).saturating_add(1))
            .cloned()
            .collect())
    }

    async fn clean(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<JobId>> {
        ensure_terminal(state)?;
        let mut jobs = self.jobs.lock().await;

        let mut expired: Vec<&Job> = jobs
            .values()
            .filter(|j| j.state == state && j.index_time() < cutoff)
            .collect();
        expired.sort_by_key(|j| j.index_time());
        let ids: Vec<JobId> = expired.into_iter().take(limit).map(|j| j.id).collect();

        for id in &ids {
            jobs.remove(id);
        }
        Ok(ids)
    }

    async fn trim(&self, state: JobState, keep: usize) -> QueueResult<Vec<JobId>> {
        ensure_terminal(state)?;
        let mut jobs = self.jobs.lock().await;

        let ids: Vec<JobId> = sorted_in_state(&jobs, state)
            .into_iter()
            .skip(keep)
            .map(|j| j.id)
            .collect();

        for id in &ids {
            jobs.remove(id);
        }
        Ok(ids)
    }

    async fn set_paused(&self, paused: bool) -> QueueResult<()> {
        self.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    async fn is_paused(&self) -> QueueResult<bool> {
        Ok(self.paused.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn job(key: &str, now: DateTime<Utc>, delay_secs: i64) -> Job {
        Job::new(
            key,
            json!({"url": key}),
            3,
            now,
            now + chrono::Duration::seconds(delay_secs),
        )
    }

    #[tokio::test]
    async fn test_replace_returns_previous() {
        let store = MemoryStore::new();
        let now = Utc::now();

        assert!(store.replace(&job("a", now, 10)).await.unwrap().is_none());
        let previous = store.replace(&job("a", now, 20)).await.unwrap();

        assert!(previous.is_some());
        assert_eq!(store.counts().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_claim_respects_run_at() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.replace(&job("a", now, 60)).await.unwrap();

        assert!(store.claim_next(now).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(60);
        let claimed = store.claim_next(later).await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);

        assert!(store.claim_next(later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_takes_earliest_run_at() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.replace(&job("late", now, 30)).await.unwrap();
        store.replace(&job("early", now, 10)).await.unwrap();

        let later = now + chrono::Duration::seconds(60);
        let first = store.claim_next(later).await.unwrap().unwrap();
        assert_eq!(first.resource_key, "early");
    }

    #[tokio::test]
    async fn test_save_if_current_rejects_stale_token() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let original = job("a", now, 0);
        store.replace(&original).await.unwrap();

        let replacement = job("a", now, 180);
        store.replace(&replacement).await.unwrap();

        let mut stale = original.clone();
        stale.complete(json!(null), now);
        assert!(!store.save_if_current(&stale).await.unwrap());

        let stored = store.get(original.id).await.unwrap().unwrap();
        assert_eq!(stored.token, replacement.token);
        assert_eq!(stored.state, JobState::Delayed);
    }

    #[tokio::test]
    async fn test_promote_due_counts_promoted_jobs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.replace(&job("due", now, 0)).await.unwrap();
        store.replace(&job("later", now, 60)).await.unwrap();

        assert_eq!(store.promote_due(now).await.unwrap(), 1);
        assert_eq!(store.promote_due(now).await.unwrap(), 0);

        let counts = store.counts().await.unwrap();
        assert_eq!((counts.waiting, counts.delayed), (1, 1));
    }

    #[tokio::test]
    async fn test_progress_only_lands_on_the_active_run() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.replace(&job("a", now, 0)).await.unwrap();

        let mut running = store.claim_next(now).await.unwrap().unwrap();
        assert!(store.record_progress(running.id, running.token, 40).await.unwrap());
        assert!(!store.record_progress(running.id, Uuid::new_v4(), 60).await.unwrap());

        running.complete(json!("done"), now);
        assert!(store.save_if_current(&running).await.unwrap());
        assert!(!store.record_progress(running.id, running.token, 50).await.unwrap());

        let stored = store.get(running.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.progress, 100);
    }

    #[tokio::test]
    async fn test_clean_only_touches_requested_terminal_state() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut done = job("done", now, 0);
        done.start_processing(now);
        done.complete(json!(true), now);
        store.replace(&done).await.unwrap();
        store.replace(&job("pending", now, 0)).await.unwrap();

        let later = now + chrono::Duration::hours(2);
        let removed = store
            .clean(JobState::Completed, later, 100)
            .await
            .unwrap();
        assert_eq!(removed, vec![done.id]);
        assert_eq!(store.counts().await.unwrap().delayed, 1);

        assert!(store.clean(JobState::Delayed, later, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_trim_keeps_newest() {
        let store = MemoryStore::new();
        let now = Utc::now();

        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            let finished = now + chrono::Duration::seconds(i as i64);
            let mut j = job(key, now, 0);
            j.max_attempts = 1;
            j.start_processing(now);
            j.fail("err", Duration::from_secs(1), finished);
            assert_eq!(j.state, JobState::Failed);
            store.replace(&j).await.unwrap();
        }

        let removed = store.trim(JobState::Failed, 2).await.unwrap();
        assert_eq!(removed.len(), 1);

        let left = store.list(JobState::Failed, 0, 10).await.unwrap();
        let keys: Vec<&str> = left.iter().map(|j| j.resource_key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_list_range_is_inclusive() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            store.replace(&job(key, now, i as i64 + 10)).await.unwrap();
        }

        let page = store.list(JobState::Delayed, 1, 2).await.unwrap();
        let keys: Vec<&str> = page.iter().map(|j| j.resource_key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);

        assert!(store.list(JobState::Delayed, 3, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_flag() {
        let store = MemoryStore::new();
        assert!(!store.is_paused().await.unwrap());
        store.set_paused(true).await.unwrap();
        assert!(store.is_paused().await.unwrap());
    }
}
