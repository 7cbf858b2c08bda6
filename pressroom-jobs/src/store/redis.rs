//! Redis queue store
//!
//! Key layout under the configured prefix:
//!
//! - `{prefix}:job:{id}` hash holding the job fields
//! - `{prefix}:queue:{queue}:{status}` sorted set per status
//! - `{prefix}:queue:{queue}:seq` insertion counter
//! - `{prefix}:queue:{queue}:last_processed` last completion (ms)
//! - `{prefix}:workers:{queue}` worker heartbeats (ms)
//!
//! Every move between sets is a Lua script, so concurrent workers on any
//! number of hosts observe one atomic compare-and-move.

use super::{GuardOutcome, QueueStore, WorkerCounts, offset, resting_score};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobStatus, QueueName};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, trace};

static INSERT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            return false
        end
        local seq = redis.call('INCR', KEYS[3])
        redis.call('HSET', KEYS[1], unpack(ARGV, 3))
        local score = tonumber(ARGV[1]) * 1000000000000 + (seq % 1000000000000)
        redis.call('ZADD', KEYS[2], string.format('%.0f', score), ARGV[2])
        return seq
        "#,
    )
});

static LEASE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        while true do
            local popped = redis.call('ZPOPMIN', KEYS[1])
            if #popped == 0 then
                return false
            end
            local id = popped[1]
            local key = ARGV[1] .. id
            if redis.call('EXISTS', key) == 1 then
                redis.call('HSET', key, 'status', 'processing', 'started_at', ARGV[2], 'progress', '0')
                redis.call('HINCRBY', key, 'attempts', 1)
                redis.call('ZADD', KEYS[2], ARGV[3], id)
                return redis.call('HGETALL', key)
            end
        end
        "#,
    )
});

static TRANSITION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if not redis.call('ZSCORE', KEYS[2], ARGV[1]) then
            return 0
        end
        if redis.call('HGET', KEYS[1], 'attempts') ~= ARGV[2] then
            return 0
        end

        local score = ARGV[4]
        if ARGV[3] == 'seq' then
            local seq = redis.call('INCR', KEYS[4])
            score = string.format('%.0f', tonumber(ARGV[4]) * 1000000000000 + (seq % 1000000000000))
        end

        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('HSET', KEYS[1], unpack(ARGV, 6))
        redis.call('ZADD', KEYS[3], score, ARGV[1])
        if ARGV[5] ~= '' then
            redis.call('SET', KEYS[5], ARGV[5])
        end
        return 1
        "#,
    )
});

static RENEW: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if not redis.call('ZSCORE', KEYS[2], ARGV[1]) then
            return 0
        end
        if redis.call('HGET', KEYS[1], 'attempts') ~= ARGV[2] then
            return 0
        end
        redis.call('ZADD', KEYS[2], 'XX', ARGV[3], ARGV[1])
        return 1
        "#,
    )
});

static PROGRESS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local status = redis.call('HGET', KEYS[1], 'status')
        if not status then
            return -1
        end
        if status ~= 'processing' then
            return 0
        end
        redis.call('HSET', KEYS[1], 'progress', ARGV[1])
        return 1
        "#,
    )
});

static REMOVE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local meta = redis.call('HMGET', KEYS[1], 'queue_name', 'status')
        if not meta[1] then
            return -1
        end
        if meta[2] == 'processing' then
            return 0
        end
        redis.call('ZREM', ARGV[1] .. meta[1] .. ':' .. meta[2], ARGV[2])
        redis.call('DEL', KEYS[1])
        return 1
        "#,
    )
});

static PURGE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2], 'LIMIT', 0, tonumber(ARGV[3]))
        for _, id in ipairs(ids) do
            redis.call('DEL', ARGV[1] .. id)
            redis.call('ZREM', KEYS[1], id)
        end
        return #ids
        "#,
    )
});

/// Redis-backed queue store
///
/// Clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect using the URL and key prefix of `config`.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        debug!(url = %config.redis_url, prefix = %config.key_prefix, "Connecting queue store to Redis");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;

        info!(prefix = %config.key_prefix, "Redis queue store ready");
        Ok(Self::new(connection, config.key_prefix.clone()))
    }

    /// Wrap an existing connection.
    pub fn new(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn queue_key_prefix(&self) -> String {
        format!("{}:queue:", self.prefix)
    }

    fn set_key(&self, queue: QueueName, status: JobStatus) -> String {
        format!("{}:queue:{}:{}", self.prefix, queue, status)
    }

    fn seq_key(&self, queue: QueueName) -> String {
        format!("{}:queue:{}:seq", self.prefix, queue)
    }

    fn last_processed_key(&self, queue: QueueName) -> String {
        format!("{}:queue:{}:last_processed", self.prefix, queue)
    }

    fn workers_key(&self, queue: QueueName) -> String {
        format!("{}:workers:{}", self.prefix, queue)
    }

    async fn fetch_many(&self, ids: Vec<String>) -> QueueResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HGETALL").arg(format!("{}{}", self.job_key_prefix(), id));
        }

        let mut conn = self.connection.clone();
        let records: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        // A hash deleted between the range read and the pipeline is skipped.
        records
            .into_iter()
            .filter(|fields| !fields.is_empty())
            .map(from_fields)
            .collect()
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        let mut invocation = INSERT.prepare_invoke();
        invocation
            .key(self.job_key(&job.id))
            .key(self.set_key(job.queue_name, JobStatus::Pending))
            .key(self.seq_key(job.queue_name))
            .arg(job.priority.band())
            .arg(job.id.to_string());
        for (field, value) in to_fields(job)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.connection.clone();
        let seq: Option<u64> = invocation.invoke_async(&mut conn).await?;
        let Some(seq) = seq else {
            return Err(QueueError::Conflict(format!("job {} already exists", job.id)));
        };
        trace!(job_id = %job.id, queue = %job.queue_name, seq = seq, "Inserted job");
        Ok(())
    }

    async fn lease(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> QueueResult<Option<Job>> {
        let deadline = offset(now, lease_ttl);

        let mut conn = self.connection.clone();
        let fields: Option<HashMap<String, String>> = LEASE
            .key(self.set_key(queue, JobStatus::Pending))
            .key(self.set_key(queue, JobStatus::Processing))
            .arg(self.job_key_prefix())
            .arg(timestamp(now))
            .arg(deadline.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        fields.map(from_fields).transpose()
    }

    async fn renew_lease(&self, job: &Job, deadline: DateTime<Utc>) -> QueueResult<bool> {
        let mut conn = self.connection.clone();
        let renewed: i64 = RENEW
            .key(self.job_key(&job.id))
            .key(self.set_key(job.queue_name, JobStatus::Processing))
            .arg(job.id.to_string())
            .arg(job.attempts)
            .arg(deadline.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn transition(
        &self,
        job: &Job,
        from: JobStatus,
        ready_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        let (mode, score) = if job.status == JobStatus::Pending {
            ("seq", job.priority.band())
        } else {
            ("score", resting_score(job, ready_at))
        };
        let last_processed = match (job.status, job.completed_at) {
            (JobStatus::Completed, Some(at)) => at.timestamp_millis().to_string(),
            (JobStatus::Completed, None) => Utc::now().timestamp_millis().to_string(),
            _ => String::new(),
        };

        let mut invocation = TRANSITION.prepare_invoke();
        invocation
            .key(self.job_key(&job.id))
            .key(self.set_key(job.queue_name, from))
            .key(self.set_key(job.queue_name, job.status))
            .key(self.seq_key(job.queue_name))
            .key(self.last_processed_key(job.queue_name))
            .arg(job.id.to_string())
            .arg(job.attempts)
            .arg(mode)
            .arg(score)
            .arg(last_processed);
        for (field, value) in to_fields(job)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.connection.clone();
        let moved: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(moved == 1)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(&id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        from_fields(fields).map(Some)
    }

    async fn list(
        &self,
        queue: QueueName,
        status: JobStatus,
        offset: u64,
        limit: u64,
    ) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = offset as isize;
        let stop = (offset + limit - 1) as isize;

        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrange(self.set_key(queue, status), start, stop)
            .await?;
        self.fetch_many(ids).await
    }

    async fn count(&self, queue: QueueName, status: JobStatus) -> QueueResult<u64> {
        let mut conn = self.connection.clone();
        let count: u64 = conn.zcard(self.set_key(queue, status)).await?;
        Ok(count)
    }

    async fn due(
        &self,
        queue: QueueName,
        status: JobStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(
                self.set_key(queue, status),
                "-inf",
                now.timestamp_millis(),
                0,
                limit as isize,
            )
            .await?;
        self.fetch_many(ids).await
    }

    async fn remove(&self, id: JobId) -> QueueResult<GuardOutcome> {
        let mut conn = self.connection.clone();
        let removed: i64 = REMOVE
            .key(self.job_key(&id))
            .arg(self.queue_key_prefix())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(guard_outcome(removed))
    }

    async fn purge(
        &self,
        queue: QueueName,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64> {
        let mut conn = self.connection.clone();
        let purged: u64 = PURGE
            .key(self.set_key(queue, status))
            .arg(self.job_key_prefix())
            .arg(cutoff.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(purged)
    }

    async fn set_progress(&self, id: JobId, progress: u8) -> QueueResult<GuardOutcome> {
        let mut conn = self.connection.clone();
        let updated: i64 = PROGRESS
            .key(self.job_key(&id))
            .arg(progress)
            .invoke_async(&mut conn)
            .await?;
        Ok(guard_outcome(updated))
    }

    async fn touch_worker(
        &self,
        queue: QueueName,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .zadd(self.workers_key(queue), worker_id, now.timestamp_millis())
            .await?;
        Ok(())
    }

    async fn remove_worker(&self, queue: QueueName, worker_id: &str) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.zrem(self.workers_key(queue), worker_id).await?;
        Ok(())
    }

    async fn prune_workers(&self, queue: QueueName, before: DateTime<Utc>) -> QueueResult<u64> {
        let mut conn = self.connection.clone();
        let pruned: u64 = conn
            .zrembyscore(
                self.workers_key(queue),
                "-inf",
                format!("({}", before.timestamp_millis()),
            )
            .await?;
        Ok(pruned)
    }

    async fn workers(
        &self,
        queue: QueueName,
        active_since: DateTime<Utc>,
    ) -> QueueResult<WorkerCounts> {
        let key = self.workers_key(queue);
        let mut conn = self.connection.clone();
        let total: u64 = conn.zcard(&key).await?;
        let active: u64 = conn
            .zcount(&key, active_since.timestamp_millis(), "+inf")
            .await?;
        Ok(WorkerCounts { total, active })
    }

    async fn last_processed(&self, queue: QueueName) -> QueueResult<Option<DateTime<Utc>>> {
        let mut conn = self.connection.clone();
        let millis: Option<i64> = conn.get(self.last_processed_key(queue)).await?;
        Ok(millis.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

fn guard_outcome(code: i64) -> GuardOutcome {
    match code {
        1 => GuardOutcome::Applied,
        0 => GuardOutcome::WrongState,
        _ => GuardOutcome::NotFound,
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn optional_timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(timestamp).unwrap_or_default()
}

/// Flatten a job into hash fields. Absent optionals are empty strings.
fn to_fields(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    Ok(vec![
        ("id", job.id.to_string()),
        ("queue_name", job.queue_name.to_string()),
        ("job_type", job.job_type.clone()),
        ("priority", job.priority.to_string()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("status", job.status.to_string()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("progress", job.progress.to_string()),
        ("error_msg", job.error_msg.clone().unwrap_or_default()),
        ("created_at", timestamp(job.created_at)),
        ("started_at", optional_timestamp(job.started_at)),
        ("completed_at", optional_timestamp(job.completed_at)),
    ])
}

fn from_fields(mut fields: HashMap<String, String>) -> QueueResult<Job> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| QueueError::Deserialization(format!("job hash lacks '{}'", name)))
    };

    Ok(Job {
        id: parse(&take("id")?, "id")?,
        queue_name: parse(&take("queue_name")?, "queue_name")?,
        job_type: take("job_type")?,
        priority: parse(&take("priority")?, "priority")?,
        payload: serde_json::from_str(&take("payload")?)?,
        status: parse(&take("status")?, "status")?,
        attempts: parse(&take("attempts")?, "attempts")?,
        max_attempts: parse(&take("max_attempts")?, "max_attempts")?,
        progress: parse(&take("progress")?, "progress")?,
        error_msg: Some(take("error_msg")?).filter(|msg| !msg.is_empty()),
        created_at: parse_timestamp(&take("created_at")?, "created_at")?,
        started_at: parse_optional_timestamp(&take("started_at")?, "started_at")?,
        completed_at: parse_optional_timestamp(&take("completed_at")?, "completed_at")?,
    })
}

fn parse<T: std::str::FromStr>(raw: &str, field: &str) -> QueueResult<T> {
    raw.parse()
        .map_err(|_| QueueError::Deserialization(format!("invalid {}: {}", field, raw)))
}

fn parse_timestamp(raw: &str, field: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| QueueError::Deserialization(format!("invalid {}: {}", field, raw)))
}

fn parse_optional_timestamp(raw: &str, field: &str) -> QueueResult<Option<DateTime<Utc>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    parse_timestamp(raw, field).map(Some)
}
