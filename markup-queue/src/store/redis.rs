//! Redis-backed [`JobStore`].
//!
//! Layout, under a per-queue key prefix:
//!
//! - `{prefix}:job:{id}`: hash with the JSON record (`data`) and its
//!   insertion token (`token`)
//! - `{prefix}:{state}`: one sorted set per state; delayed and waiting are
//!   scored by `run_at`, active by start time, terminal states by finish time
//! - `{prefix}:paused`: present while processing is paused
//!
//! Every write that touches a record also moves its id between the state
//! sets inside one Lua script, so the record and its index never disagree.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use markup_log::{debug, info, warn};
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::sync::LazyLock;
use uuid::Uuid;

use super::{JobCounts, JobStore, ensure_terminal};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};

/// Insert or overwrite a record and re-index it. Returns the previous JSON.
static REPLACE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local previous = redis.call('HGET', KEYS[1], 'data')
        redis.call('HSET', KEYS[1], 'data', ARGV[1], 'token', ARGV[2])
        for i = 2, 6 do redis.call('ZREM', KEYS[i], ARGV[4]) end
        redis.call('ZADD', KEYS[7], ARGV[3], ARGV[4])
        return previous
        "#,
    )
});

/// Same as REPLACE, but only while the stored token matches.
static SAVE_IF_CURRENT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
            return 0
        end
        redis.call('HSET', KEYS[1], 'data', ARGV[1], 'token', ARGV[2])
        for i = 2, 6 do redis.call('ZREM', KEYS[i], ARGV[4]) end
        redis.call('ZADD', KEYS[7], ARGV[3], ARGV[4])
        return 1
        "#,
    )
});

/// Delete a record and its index entries. Returns the deleted JSON.
static REMOVE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local previous = redis.call('HGET', KEYS[1], 'data')
        redis.call('DEL', KEYS[1])
        for i = 2, 6 do redis.call('ZREM', KEYS[i], ARGV[1]) end
        return previous
        "#,
    )
});

/// Swap the record JSON only if it is still exactly `ARGV[1]`.
static COMPARE_AND_SET: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[1], 'data') ~= ARGV[1] then
            return 0
        end
        redis.call('HSET', KEYS[1], 'data', ARGV[2])
        return 1
        "#,
    )
});

/// Read-modify-write rounds a progress report gets before giving up.
const PROGRESS_ATTEMPTS: usize = 3;

/// Move the earliest waiting id to the active set.
static CLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local next = redis.call('ZRANGE', KEYS[1], 0, 0)
        if #next == 0 then
            return false
        end
        redis.call('ZREM', KEYS[1], next[1])
        redis.call('ZADD', KEYS[2], ARGV[1], next[1])
        return next[1]
        "#,
    )
});

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Queue name
    pub queue_name: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,
}

impl RedisStoreConfig {
    /// Create a new store configuration.
    pub fn new(redis_url: impl Into<String>, queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            redis_url: redis_url.into(),
            key_prefix: format!("markup:queue:{}", queue_name),
            queue_name,
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Build Redis key.
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }
}

/// Job store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn connect(config: RedisStoreConfig) -> QueueResult<Self> {
        info!(queue = %config.queue_name, "connecting job store to redis");
        debug!(prefix = %config.key_prefix, "redis job store keys");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::StoreUnavailable(e.to_string()))?;

        info!(queue = %config.queue_name, "redis job store ready");
        Ok(Self { connection, config })
    }

    /// Store configuration.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn job_key(&self, id: JobId) -> String {
        self.config.key(&format!("job:{}", id))
    }

    fn state_key(&self, state: JobState) -> String {
        self.config.key(state.as_str())
    }

    fn state_keys(&self) -> Vec<String> {
        JobState::ALL.iter().map(|s| self.state_key(*s)).collect()
    }

    async fn write<T: redis::FromRedisValue>(&self, script: &Script, job: &Job) -> QueueResult<T> {
        let json =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut invocation = script.key(self.job_key(job.id));
        for key in self.state_keys() {
            invocation.key(key);
        }
        invocation
            .key(self.state_key(job.state))
            .arg(json)
            .arg(job.token.to_string())
            .arg(job.index_time().timestamp_millis())
            .arg(job.id.to_string());

        let mut conn = self.connection.clone();
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    async fn delete(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut invocation = REMOVE.key(self.job_key(id));
        for key in self.state_keys() {
            invocation.key(key);
        }
        invocation.arg(id.to_string());

        let mut conn = self.connection.clone();
        let previous: Option<String> = invocation.invoke_async(&mut conn).await?;
        previous.as_deref().map(decode).transpose()
    }

    async fn load_many(&self, ids: Vec<String>) -> QueueResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(self.config.key(&format!("job:{}", id)), "data");
        }
        let mut conn = self.connection.clone();
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        raw.into_iter()
            .flatten()
            .map(|json| decode(&json))
            .collect()
    }

    async fn delete_ids(&self, ids: Vec<String>) -> QueueResult<Vec<JobId>> {
        let mut removed = Vec::with_capacity(ids.len());
        for raw in ids {
            match raw.parse::<JobId>() {
                Ok(id) => {
                    self.delete(id).await?;
                    removed.push(id);
                }
                Err(_) => warn!(id = %raw, "skipping malformed job id in index"),
            }
        }
        Ok(removed)
    }
}

fn decode(json: &str) -> QueueResult<Job> {
    serde_json::from_str(json).map_err(|e| QueueError::Deserialization(e.to_string()))
}

#[async_trait]
impl JobStore for RedisStore {
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.hget(self.job_key(id), "data").await?;
        json.as_deref().map(decode).transpose()
    }

    async fn replace(&self, job: &Job) -> QueueResult<Option<Job>> {
        let previous: Option<String> = self.write(&REPLACE, job).await?;
        previous.as_deref().map(decode).transpose()
    }

    async fn save_if_current(&self, job: &Job) -> QueueResult<bool> {
        let saved: i64 = self.write(&SAVE_IF_CURRENT, job).await?;
        Ok(saved == 1)
    }

    async fn remove(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.delete(id).await
    }

    async fn record_progress(&self, id: JobId, token: Uuid, progress: u8) -> QueueResult<bool> {
        let key = self.job_key(id);
        for _ in 0..PROGRESS_ATTEMPTS {
            let mut conn = self.connection.clone();
            let Some(current): Option<String> = conn.hget(&key, "data").await? else {
                return Ok(false);
            };
            let mut job = decode(&current)?;
            if job.state != JobState::Active || job.token != token {
                return Ok(false);
            }

            job.update_progress(progress);
            let updated =
                serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;
            let swapped: i64 = COMPARE_AND_SET
                .key(&key)
                .arg(current)
                .arg(updated)
                .invoke_async(&mut conn)
                .await?;
            if swapped == 1 {
                return Ok(true);
            }
        }
        debug!(job_id = %id, "progress report lost to concurrent writes");
        Ok(false)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let mut conn = self.connection.clone();
        let due: Vec<String> = conn
            .zrangebyscore(
                self.state_key(JobState::Delayed),
                "-inf",
                now.timestamp_millis(),
            )
            .await?;

        let mut promoted = 0;
        for job in self.load_many(due).await? {
            let mut job = job;
            if job.promote(now) && self.save_if_current(&job).await? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        self.promote_due(now).await?;

        loop {
            let mut conn = self.connection.clone();
            let claimed: Option<String> = CLAIM
                .key(self.state_key(JobState::Waiting))
                .key(self.state_key(JobState::Active))
                .arg(now.timestamp_millis())
                .invoke_async(&mut conn)
                .await?;

            let Some(raw) = claimed else {
                return Ok(None);
            };
            let Ok(id) = raw.parse::<JobId>() else {
                warn!(id = %raw, "dropping malformed job id from waiting set");
                let _: () = conn.zrem(self.state_key(JobState::Active), &raw).await?;
                continue;
            };

            let Some(mut job) = self.get(id).await? else {
                // Removed between the index pop and the read.
                let _: () = conn.zrem(self.state_key(JobState::Active), &raw).await?;
                continue;
            };

            job.start_processing(now);
            if self.save_if_current(&job).await? {
                return Ok(Some(job));
            }
            debug!(job_id = %id, "claimed job was replaced before activation");
        }
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let mut pipe = redis::pipe();
        for key in self.state_keys() {
            pipe.zcard(key);
        }
        let mut conn = self.connection.clone();
        let sizes: Vec<usize> = pipe.query_async(&mut conn).await?;

        let mut counts = JobCounts::default();
        for (state, n) in JobState::ALL.iter().zip(sizes) {
            counts.add(*state, n);
        }
        Ok(counts)
    }

    async fn list(&self, state: JobState, start: usize, end: usize) -> QueueResult<Vec<Job>> {
        if end < start {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let key = self.state_key(state);
        let start = isize::try_from(start).unwrap_or(isize::MAX);
        // -1 addresses the last member, which is what an unbounded end means.
        let end = isize::try_from(end).unwrap_or(-1);
        let ids: Vec<String> = if state.is_terminal() {
            conn.zrevrange(key, start, end).await?
        } else {
            conn.zrange(key, start, end).await?
        };
        self.load_many(ids).await
    }

    async fn clean(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<JobId>> {
        ensure_terminal(state)?;
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(
                self.state_key(state),
                "-inf",
                format!("({}", cutoff.timestamp_millis()),
                0,
                limit as isize,
            )
            .await?;
        self.delete_ids(ids).await
    }

    async fn trim(&self, state: JobState, keep: usize) -> QueueResult<Vec<JobId>> {
        ensure_terminal(state)?;
        let mut conn = self.connection.clone();
        let key = self.state_key(state);
        let size: usize = conn.zcard(&key).await?;
        if size <= keep {
            return Ok(Vec::new());
        }
        let oldest: Vec<String> = conn.zrange(&key, 0, (size - keep - 1) as isize).await?;
        self.delete_ids(oldest).await
    }

    async fn set_paused(&self, paused: bool) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let key = self.config.key("paused");
        if paused {
            let _: () = conn.set(key, 1).await?;
        } else {
            let _: () = conn.del(key).await?;
        }
        Ok(())
    }

    async fn is_paused(&self) -> QueueResult<bool> {
        let mut conn = self.connection.clone();
        Ok(conn.exists(self.config.key("paused")).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_config() {
        let config = RedisStoreConfig::new("redis://localhost:6379", "scrapes");
        assert_eq!(config.queue_name, "scrapes");
        assert_eq!(config.key_prefix, "markup:queue:scrapes");
    }

    #[test]
    fn test_store_config_with_custom_prefix() {
        let config = RedisStoreConfig::new("redis://localhost:6379", "scrapes")
            .with_key_prefix("staging:scrapes");
        assert_eq!(config.key("delayed"), "staging:scrapes:delayed");
    }

    #[test]
    fn test_distinct_queues_use_distinct_keys() {
        let a = RedisStoreConfig::new("redis://localhost:6379", "a");
        let b = RedisStoreConfig::new("redis://localhost:6379", "b");
        assert_ne!(a.key("waiting"), b.key("waiting"));
    }

    // These tests need a running Redis:
    // cargo test -p markup-queue -- --ignored

    #[tokio::test]
    #[ignore]
    async fn test_redis_claim_roundtrip() {
        let config = RedisStoreConfig::new("redis://localhost:6379", "markup-test-claim");
        let store = RedisStore::connect(config).await.unwrap();
        let now = Utc::now();
        let job = Job::new("https://app.markup.io/markup/redis", json!({}), 3, now, now);
        store.remove(job.id).await.unwrap();

        assert!(store.replace(&job).await.unwrap().is_none());
        let claimed = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(store.counts().await.unwrap().active, 1);
        assert!(store.claim_next(now).await.unwrap().is_none());

        store.remove(job.id).await.unwrap();
        assert!(store.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_stale_token_rejected() {
        let config = RedisStoreConfig::new("redis://localhost:6379", "markup-test-token");
        let store = RedisStore::connect(config).await.unwrap();
        let now = Utc::now();
        let first = Job::new("https://app.markup.io/markup/token", json!({}), 3, now, now);
        let second = Job::new("https://app.markup.io/markup/token", json!({}), 3, now, now);

        store.replace(&first).await.unwrap();
        store.replace(&second).await.unwrap();
        assert!(!store.save_if_current(&first).await.unwrap());
        assert!(store.save_if_current(&second).await.unwrap());

        store.remove(first.id).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_progress_requires_active_run() {
        let config = RedisStoreConfig::new("redis://localhost:6379", "markup-test-progress");
        let store = RedisStore::connect(config).await.unwrap();
        let now = Utc::now();
        let job = Job::new("https://app.markup.io/markup/progress", json!({}), 3, now, now);
        store.remove(job.id).await.unwrap();

        store.replace(&job).await.unwrap();
        assert!(!store.record_progress(job.id, job.token, 10).await.unwrap());

        let mut running = store.claim_next(now).await.unwrap().unwrap();
        assert!(store.record_progress(job.id, job.token, 30).await.unwrap());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 30);

        running.complete(json!(null), now);
        store.save_if_current(&running).await.unwrap();
        assert!(!store.record_progress(job.id, job.token, 50).await.unwrap());

        store.remove(job.id).await.unwrap();
    }
}
