//! Queue storage backends
//!
//! Every named queue owns one sorted set per [`JobStatus`]. A job lives in
//! exactly one of them at any instant; moving it between sets is the only way
//! its status changes.
//!
//! - **Redis**: Lua scripts make every multi-key move atomic; shared by every
//!   process pointed at the same server.
//! - **Memory**: one mutex around all sets; single process only.
//!
//! Set scores:
//!
//! | Set | Score |
//! |-----|-------|
//! | pending | `band * 10^12 + seq`, leased lowest first |
//! | processing | lease deadline (ms) |
//! | retrying | ready time (ms) |
//! | completed / failed / dead | completion time (ms) |

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::QueueResult;
use crate::job::{Job, JobId, JobStatus, Priority, QueueName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Width of one priority band inside a pending set.
pub(crate) const BAND_WIDTH: i64 = 1_000_000_000_000;

/// Pending-set score of a job inserted with sequence number `seq`.
pub(crate) fn pending_score(priority: Priority, seq: u64) -> i64 {
    priority.band() * BAND_WIDTH + (seq as i64 % BAND_WIDTH)
}

/// Score of a job entering a non-pending set.
pub(crate) fn resting_score(job: &Job, ready_at: Option<DateTime<Utc>>) -> i64 {
    ready_at
        .or(job.completed_at)
        .unwrap_or_else(Utc::now)
        .timestamp_millis()
}

/// `now + by`, saturating at the end of time.
pub(crate) fn offset(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - by`, saturating at the start of time.
pub(crate) fn before(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Outcome of a guarded single-job mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The mutation happened
    Applied,
    /// No such job
    NotFound,
    /// The job exists but its status forbids the mutation
    WrongState,
}

/// Registered and recently active workers of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    pub total: u64,
    pub active: u64,
}

/// Trait for queue storage backends
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Write a new pending job and append it to its priority band.
    ///
    /// Fails with [`QueueError::Conflict`](crate::error::QueueError::Conflict)
    /// if a job with the same id is already stored.
    async fn insert(&self, job: &Job) -> QueueResult<()>;

    /// Atomically move the next pending job to processing.
    ///
    /// The returned job has `attempts` incremented and `started_at = now`;
    /// its lease runs until `now + lease_ttl`.
    async fn lease(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> QueueResult<Option<Job>>;

    /// Push a lease deadline out. Returns false if the lease was lost.
    async fn renew_lease(&self, job: &Job, deadline: DateTime<Utc>) -> QueueResult<bool>;

    /// Compare-and-move: store `job` in the set of `job.status`, provided it
    /// currently sits in the `from` set with the same `attempts` value.
    ///
    /// `ready_at` scores a `retrying` target; terminal targets are scored by
    /// `completed_at`; a `pending` target goes to the tail of its band.
    /// Returns false when the guard does not hold.
    async fn transition(
        &self,
        job: &Job,
        from: JobStatus,
        ready_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool>;

    /// Fetch a job by ID.
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Page through one set in score order.
    async fn list(
        &self,
        queue: QueueName,
        status: JobStatus,
        offset: u64,
        limit: u64,
    ) -> QueueResult<Vec<Job>>;

    /// Cardinality of one set.
    async fn count(&self, queue: QueueName, status: JobStatus) -> QueueResult<u64>;

    /// Jobs of one set whose score is at or before `now`.
    ///
    /// For processing these are expired leases, for retrying the jobs whose
    /// backoff has elapsed.
    async fn due(
        &self,
        queue: QueueName,
        status: JobStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Job>>;

    /// Delete a job that is not processing.
    async fn remove(&self, id: JobId) -> QueueResult<GuardOutcome>;

    /// Delete up to `limit` jobs of a terminal set completed before `cutoff`.
    async fn purge(
        &self,
        queue: QueueName,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64>;

    /// Set progress on a processing job.
    async fn set_progress(&self, id: JobId, progress: u8) -> QueueResult<GuardOutcome>;

    /// Record a worker heartbeat.
    async fn touch_worker(
        &self,
        queue: QueueName,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Forget a worker.
    async fn remove_worker(&self, queue: QueueName, worker_id: &str) -> QueueResult<()>;

    /// Forget workers whose last heartbeat predates `before`.
    async fn prune_workers(&self, queue: QueueName, before: DateTime<Utc>) -> QueueResult<u64>;

    /// Registered workers, and those heard from since `active_since`.
    async fn workers(
        &self,
        queue: QueueName,
        active_since: DateTime<Utc>,
    ) -> QueueResult<WorkerCounts>;

    /// When the queue last completed a job.
    async fn last_processed(&self, queue: QueueName) -> QueueResult<Option<DateTime<Utc>>>;

    /// Check connectivity.
    async fn ping(&self) -> QueueResult<()>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}
