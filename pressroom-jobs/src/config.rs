//! Queue, backoff and scheduler configuration.
//!
//! Everything is plain builder-style structs with sensible defaults. A whole
//! [`SchedulerConfig`] can also be loaded from `PRESSROOM_*` environment
//! variables or from a TOML document:
//!
//! ```toml
//! [queue]
//! redis_url = "redis://cache:6379"
//! max_attempts = 5
//! lease_ttl_secs = 60
//!
//! [queue.max_attempts_by_queue]
//! video_processing = 2
//!
//! [backoff]
//! initial_ms = 500
//! max_secs = 120
//!
//! [workers.translations]
//! concurrency = 8
//! job_timeout_secs = 600
//! ```

use crate::error::{QueueError, QueueResult};
use crate::job::{DEFAULT_MAX_ATTEMPTS, QueueName};
use crate::worker::WorkerConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

/// Store and manager configuration shared by every queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Prefix of every Redis key written by the store
    pub key_prefix: String,

    /// Attempt budget for jobs enqueued through the typed helpers
    pub max_attempts: u32,

    /// Per-queue overrides of `max_attempts`
    pub queue_max_attempts: HashMap<QueueName, u32>,

    /// How long a lease stays valid without a heartbeat
    pub lease_ttl: Duration,

    /// How long a worker counts as active after its last heartbeat
    pub worker_ttl: Duration,

    /// How long terminal jobs are kept before the retention sweep drops them
    pub retention_time: Duration,

    /// Upper bound on `limit` for job listings
    pub max_page_size: u64,

    /// Pending jobs with no completion for this long mark a queue stalled
    pub stall_threshold: Duration,

    /// Pending jobs above this count mark a queue degraded
    pub backlog_threshold: u64,

    /// Delay curve for `retrying -> pending`
    pub backoff: BackoffPolicy,

    /// Jobs handled per maintenance sweep and per store round trip
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "pressroom:jobs".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            queue_max_attempts: HashMap::new(),
            lease_ttl: Duration::from_secs(30),
            worker_ttl: Duration::from_secs(60),
            retention_time: Duration::from_secs(7 * 24 * 3600),
            max_page_size: 100,
            stall_threshold: Duration::from_secs(15 * 60),
            backlog_threshold: 1000,
            backoff: BackoffPolicy::default(),
            batch_size: 100,
        }
    }
}

impl QueueConfig {
    /// Create a configuration for the given Redis URL.
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the attempt budget of one queue.
    pub fn with_queue_max_attempts(mut self, queue: QueueName, max_attempts: u32) -> Self {
        self.queue_max_attempts.insert(queue, max_attempts);
        self
    }

    /// Set the lease TTL.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Set the worker liveness TTL.
    pub fn with_worker_ttl(mut self, worker_ttl: Duration) -> Self {
        self.worker_ttl = worker_ttl;
        self
    }

    /// Set the retention time for terminal jobs.
    pub fn with_retention_time(mut self, retention_time: Duration) -> Self {
        self.retention_time = retention_time;
        self
    }

    /// Set the maximum page size for listings.
    pub fn with_max_page_size(mut self, max_page_size: u64) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    /// Set the stall threshold used by health reporting.
    pub fn with_stall_threshold(mut self, stall_threshold: Duration) -> Self {
        self.stall_threshold = stall_threshold;
        self
    }

    /// Set the backlog threshold used by health reporting.
    pub fn with_backlog_threshold(mut self, backlog_threshold: u64) -> Self {
        self.backlog_threshold = backlog_threshold;
        self
    }

    /// Set the retry backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attempt budget for jobs of `queue`.
    pub fn max_attempts_for(&self, queue: QueueName) -> u32 {
        self.queue_max_attempts
            .get(&queue)
            .copied()
            .unwrap_or(self.max_attempts)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 || self.queue_max_attempts.values().any(|n| *n == 0) {
            return Err(QueueError::Config("max_attempts must be at least 1".into()));
        }
        if self.lease_ttl.is_zero() {
            return Err(QueueError::Config("lease_ttl must be positive".into()));
        }
        if self.max_page_size == 0 {
            return Err(QueueError::Config("max_page_size must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(QueueError::Config("batch_size must be at least 1".into()));
        }
        self.backoff.validate()
    }
}

/// Exponential backoff with bounded jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Upper bound on any delay, jitter included
    pub max: Duration,

    /// Extra random delay as a fraction of the base delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Exponential backoff from `initial`, doubling, without jitter.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max,
            jitter: 0.0,
        }
    }

    /// Same delay for every attempt.
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1.0,
            max: delay,
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before returning a job to pending after its `attempt`-th failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let max_secs = self.max.as_secs_f64();
        let base = (self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent)).min(max_secs);

        let delay = if self.jitter > 0.0 {
            base * (1.0 + rand::random::<f64>() * self.jitter)
        } else {
            base
        };

        Duration::from_secs_f64(delay.min(max_secs).max(0.0))
    }

    fn validate(&self) -> QueueResult<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(QueueError::Config("backoff jitter must be within 0.0..=1.0".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(QueueError::Config("backoff multiplier must be >= 1.0".into()));
        }
        if self.initial > self.max {
            return Err(QueueError::Config("backoff initial delay exceeds max".into()));
        }
        Ok(())
    }
}

/// Everything needed to run the scheduler in one process.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Store and manager settings
    pub queue: QueueConfig,

    /// Worker pool settings per queue; a concurrency of 0 disables the pool
    pub workers: BTreeMap<QueueName, WorkerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = QueueName::ALL
            .into_iter()
            .map(|queue| (queue, WorkerConfig::default()))
            .collect();

        Self {
            queue: QueueConfig::default(),
            workers,
        }
    }
}

impl SchedulerConfig {
    /// Load from the process environment, reading a `.env` file first if present.
    pub fn from_env() -> QueueResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Load from an explicit set of `PRESSROOM_*` variables.
    pub fn from_vars<I, K, V>(vars: I) -> QueueResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let env = EnvVars(&vars);

        let mut raw = RawSchedulerConfig::default();

        raw.queue.redis_url = env
            .string("PRESSROOM_REDIS_URL")
            .or_else(|| env.string("REDIS_URL"));
        raw.queue.key_prefix = env.string("PRESSROOM_KEY_PREFIX");
        raw.queue.max_attempts = env.parse("PRESSROOM_MAX_ATTEMPTS")?;
        raw.queue.lease_ttl_secs = env.parse("PRESSROOM_LEASE_TTL_SECS")?;
        raw.queue.worker_ttl_secs = env.parse("PRESSROOM_WORKER_TTL_SECS")?;
        raw.queue.retention_hours = env.parse("PRESSROOM_RETENTION_HOURS")?;
        raw.queue.max_page_size = env.parse("PRESSROOM_MAX_PAGE_SIZE")?;
        raw.queue.stall_threshold_secs = env.parse("PRESSROOM_STALL_THRESHOLD_SECS")?;
        raw.queue.backlog_threshold = env.parse("PRESSROOM_BACKLOG_THRESHOLD")?;

        raw.backoff.initial_ms = env.parse("PRESSROOM_BACKOFF_INITIAL_MS")?;
        raw.backoff.multiplier = env.parse("PRESSROOM_BACKOFF_MULTIPLIER")?;
        raw.backoff.max_secs = env.parse("PRESSROOM_BACKOFF_MAX_SECS")?;
        raw.backoff.jitter = env.parse("PRESSROOM_BACKOFF_JITTER")?;

        let poll_interval_ms = env.parse("PRESSROOM_POLL_INTERVAL_MS")?;
        let job_timeout_secs = env.parse("PRESSROOM_JOB_TIMEOUT_SECS")?;
        let heartbeat_interval_secs = env.parse("PRESSROOM_HEARTBEAT_INTERVAL_SECS")?;

        for queue in QueueName::ALL {
            let suffix = queue.as_str().to_uppercase();

            if let Some(max) = env.parse(&format!("PRESSROOM_MAX_ATTEMPTS_{}", suffix))? {
                raw.queue.max_attempts_by_queue.insert(queue, max);
            }

            raw.workers.insert(
                queue,
                RawWorkerConfig {
                    concurrency: env.parse(&format!("PRESSROOM_WORKERS_{}", suffix))?,
                    poll_interval_ms,
                    job_timeout_secs,
                    heartbeat_interval_secs,
                    ..Default::default()
                },
            );
        }

        raw.into_config()
    }

    /// Load from a TOML document.
    pub fn from_toml_str(content: &str) -> QueueResult<Self> {
        let raw: RawSchedulerConfig = toml::from_str(content)
            .map_err(|e| QueueError::Config(format!("TOML parse error: {}", e)))?;
        raw.into_config()
    }

    /// Load from a TOML file.
    pub fn load_file(path: impl AsRef<std::path::Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Worker settings for `queue`.
    pub fn worker_config(&self, queue: QueueName) -> WorkerConfig {
        self.workers.get(&queue).cloned().unwrap_or_default()
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> QueueResult<()> {
        self.queue.validate()?;
        for (queue, workers) in &self.workers {
            if workers.concurrency > 0 && workers.heartbeat_interval >= self.queue.lease_ttl {
                return Err(QueueError::Config(format!(
                    "heartbeat interval of '{}' must be shorter than the lease TTL",
                    queue
                )));
            }
        }
        Ok(())
    }
}

struct EnvVars<'a>(&'a HashMap<String, String>);

impl EnvVars<'_> {
    fn string(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> QueueResult<Option<T>> {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| QueueError::Config(format!("invalid value for {}: {}", key, raw))),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSchedulerConfig {
    queue: RawQueueConfig,
    backoff: RawBackoff,
    workers: BTreeMap<QueueName, RawWorkerConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawQueueConfig {
    redis_url: Option<String>,
    key_prefix: Option<String>,
    max_attempts: Option<u32>,
    max_attempts_by_queue: HashMap<QueueName, u32>,
    lease_ttl_secs: Option<u64>,
    worker_ttl_secs: Option<u64>,
    retention_hours: Option<u64>,
    max_page_size: Option<u64>,
    stall_threshold_secs: Option<u64>,
    backlog_threshold: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawBackoff {
    initial_ms: Option<u64>,
    multiplier: Option<f64>,
    max_secs: Option<u64>,
    jitter: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawWorkerConfig {
    concurrency: Option<usize>,
    poll_interval_ms: Option<u64>,
    job_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    maintenance_interval_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    log_execution: Option<bool>,
}

impl RawSchedulerConfig {
    fn into_config(self) -> QueueResult<SchedulerConfig> {
        let mut config = SchedulerConfig::default();
        let queue = &mut config.queue;
        let raw = self.queue;

        if let Some(url) = raw.redis_url {
            queue.redis_url = url;
        }
        if let Some(prefix) = raw.key_prefix {
            queue.key_prefix = prefix;
        }
        if let Some(max) = raw.max_attempts {
            queue.max_attempts = max;
        }
        queue.queue_max_attempts.extend(raw.max_attempts_by_queue);
        if let Some(secs) = raw.lease_ttl_secs {
            queue.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.worker_ttl_secs {
            queue.worker_ttl = Duration::from_secs(secs);
        }
        if let Some(hours) = raw.retention_hours {
            queue.retention_time = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(size) = raw.max_page_size {
            queue.max_page_size = size;
        }
        if let Some(secs) = raw.stall_threshold_secs {
            queue.stall_threshold = Duration::from_secs(secs);
        }
        if let Some(threshold) = raw.backlog_threshold {
            queue.backlog_threshold = threshold;
        }

        let backoff = &mut queue.backoff;
        if let Some(ms) = self.backoff.initial_ms {
            backoff.initial = Duration::from_millis(ms);
        }
        if let Some(multiplier) = self.backoff.multiplier {
            backoff.multiplier = multiplier;
        }
        if let Some(secs) = self.backoff.max_secs {
            backoff.max = Duration::from_secs(secs);
        }
        if let Some(jitter) = self.backoff.jitter {
            backoff.jitter = jitter;
        }

        for (name, raw_workers) in self.workers {
            let workers = config.workers.entry(name).or_default();
            if let Some(concurrency) = raw_workers.concurrency {
                workers.concurrency = concurrency;
            }
            if let Some(ms) = raw_workers.poll_interval_ms {
                workers.poll_interval = Duration::from_millis(ms);
            }
            if let Some(secs) = raw_workers.job_timeout_secs {
                workers.job_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = raw_workers.heartbeat_interval_secs {
                workers.heartbeat_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = raw_workers.maintenance_interval_secs {
                workers.maintenance_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = raw_workers.shutdown_grace_secs {
                workers.shutdown_grace = Duration::from_secs(secs);
            }
            if let Some(log) = raw_workers.log_execution {
                workers.log_execution = log;
            }
        }

        config.validate()?;
        Ok(config)
    }
}
