//! In-memory queue store
//!
//! All sets live behind one mutex, so every move is a single critical section.
//! Suitable for tests and single-process deployments; multiple processes need
//! the Redis store.

use super::{GuardOutcome, QueueStore, WorkerCounts, offset, pending_score, resting_score};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobStatus, QueueName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, trace};

/// A sorted set with Redis semantics: unique members, ordered by (score, member).
#[derive(Debug, Default)]
struct ScoredSet {
    order: BTreeSet<(i64, JobId)>,
    scores: HashMap<JobId, i64>,
}

impl ScoredSet {
    fn insert(&mut self, id: JobId, score: i64) {
        if let Some(old) = self.scores.insert(id, score) {
            self.order.remove(&(old, id));
        }
        self.order.insert((score, id));
    }

    fn remove(&mut self, id: &JobId) -> bool {
        match self.scores.remove(id) {
            Some(score) => self.order.remove(&(score, *id)),
            None => false,
        }
    }

    fn contains(&self, id: &JobId) -> bool {
        self.scores.contains_key(id)
    }

    fn pop_min(&mut self) -> Option<JobId> {
        let (_, id) = self.order.pop_first()?;
        self.scores.remove(&id);
        Some(id)
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn page(&self, offset: usize, limit: usize) -> impl Iterator<Item = JobId> + '_ {
        self.order.iter().skip(offset).take(limit).map(|(_, id)| *id)
    }

    fn up_to(&self, max_score: i64, limit: usize) -> Vec<JobId> {
        self.order
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .take(limit)
            .map(|(_, id)| *id)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    sets: HashMap<(QueueName, JobStatus), ScoredSet>,
    seq: HashMap<QueueName, u64>,
    workers: HashMap<QueueName, HashMap<String, DateTime<Utc>>>,
    last_processed: HashMap<QueueName, DateTime<Utc>>,
}

impl Inner {
    fn set(&mut self, queue: QueueName, status: JobStatus) -> &mut ScoredSet {
        self.sets.entry((queue, status)).or_default()
    }

    fn next_seq(&mut self, queue: QueueName) -> u64 {
        let seq = self.seq.entry(queue).or_insert(0);
        *seq += 1;
        *seq
    }

    fn guard_holds(&self, job: &Job, from: JobStatus) -> bool {
        let in_set = self
            .sets
            .get(&(job.queue_name, from))
            .is_some_and(|set| set.contains(&job.id));
        let same_lease = self
            .jobs
            .get(&job.id)
            .is_some_and(|stored| stored.attempts == job.attempts);
        in_set && same_lease
    }

    fn collect(&self, ids: impl Iterator<Item = JobId>) -> Vec<Job> {
        ids.filter_map(|id| self.jobs.get(&id).cloned()).collect()
    }
}

/// In-memory queue store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        debug!("Creating new in-memory queue store");
        Self::default()
    }

    /// Total number of stored jobs across all queues.
    pub fn job_count(&self) -> usize {
        self.inner.lock().jobs.len()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(QueueError::Conflict(format!("job {} already exists", job.id)));
        }
        let seq = inner.next_seq(job.queue_name);
        inner
            .set(job.queue_name, JobStatus::Pending)
            .insert(job.id, pending_score(job.priority, seq));
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn lease(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> QueueResult<Option<Job>> {
        let mut inner = self.inner.lock();
        let deadline = offset(now, lease_ttl);

        while let Some(id) = inner.set(queue, JobStatus::Pending).pop_min() {
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            job.start_processing(now);
            let leased = job.clone();
            inner
                .set(queue, JobStatus::Processing)
                .insert(id, deadline.timestamp_millis());
            trace!(job_id = %id, queue = %queue, "Leased job");
            return Ok(Some(leased));
        }

        Ok(None)
    }

    async fn renew_lease(&self, job: &Job, deadline: DateTime<Utc>) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.guard_holds(job, JobStatus::Processing) {
            return Ok(false);
        }
        inner
            .set(job.queue_name, JobStatus::Processing)
            .insert(job.id, deadline.timestamp_millis());
        Ok(true)
    }

    async fn transition(
        &self,
        job: &Job,
        from: JobStatus,
        ready_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.guard_holds(job, from) {
            return Ok(false);
        }

        let score = if job.status == JobStatus::Pending {
            let seq = inner.next_seq(job.queue_name);
            pending_score(job.priority, seq)
        } else {
            resting_score(job, ready_at)
        };

        inner.set(job.queue_name, from).remove(&job.id);
        inner.set(job.queue_name, job.status).insert(job.id, score);
        inner.jobs.insert(job.id, job.clone());

        if job.status == JobStatus::Completed {
            let at = job.completed_at.unwrap_or_else(Utc::now);
            inner.last_processed.insert(job.queue_name, at);
        }

        Ok(true)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn list(
        &self,
        queue: QueueName,
        status: JobStatus,
        offset: u64,
        limit: u64,
    ) -> QueueResult<Vec<Job>> {
        let inner = self.inner.lock();
        let Some(set) = inner.sets.get(&(queue, status)) else {
            return Ok(Vec::new());
        };
        let ids = set.page(offset as usize, limit as usize);
        Ok(inner.collect(ids))
    }

    async fn count(&self, queue: QueueName, status: JobStatus) -> QueueResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .sets
            .get(&(queue, status))
            .map_or(0, |set| set.len() as u64))
    }

    async fn due(
        &self,
        queue: QueueName,
        status: JobStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let inner = self.inner.lock();
        let Some(set) = inner.sets.get(&(queue, status)) else {
            return Ok(Vec::new());
        };
        let ids = set.up_to(now.timestamp_millis(), limit);
        Ok(inner.collect(ids.into_iter()))
    }

    async fn remove(&self, id: JobId) -> QueueResult<GuardOutcome> {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get(&id) else {
            return Ok(GuardOutcome::NotFound);
        };
        if job.status == JobStatus::Processing {
            return Ok(GuardOutcome::WrongState);
        }

        let (queue, status) = (job.queue_name, job.status);
        inner.set(queue, status).remove(&id);
        inner.jobs.remove(&id);
        Ok(GuardOutcome::Applied)
    }

    async fn purge(
        &self,
        queue: QueueName,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64> {
        let mut inner = self.inner.lock();
        let ids = inner.set(queue, status).up_to(cutoff.timestamp_millis(), limit);

        for id in &ids {
            inner.set(queue, status).remove(id);
            inner.jobs.remove(id);
        }

        Ok(ids.len() as u64)
    }

    async fn set_progress(&self, id: JobId, progress: u8) -> QueueResult<GuardOutcome> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            None => Ok(GuardOutcome::NotFound),
            Some(job) if job.status != JobStatus::Processing => Ok(GuardOutcome::WrongState),
            Some(job) => {
                job.progress = progress;
                Ok(GuardOutcome::Applied)
            }
        }
    }

    async fn touch_worker(
        &self,
        queue: QueueName,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.inner
            .lock()
            .workers
            .entry(queue)
            .or_default()
            .insert(worker_id.to_string(), now);
        Ok(())
    }

    async fn remove_worker(&self, queue: QueueName, worker_id: &str) -> QueueResult<()> {
        if let Some(workers) = self.inner.lock().workers.get_mut(&queue) {
            workers.remove(worker_id);
        }
        Ok(())
    }

    async fn prune_workers(&self, queue: QueueName, before: DateTime<Utc>) -> QueueResult<u64> {
        let mut inner = self.inner.lock();
        let Some(workers) = inner.workers.get_mut(&queue) else {
            return Ok(0);
        };
        let initial = workers.len();
        workers.retain(|_, seen| *seen >= before);
        Ok((initial - workers.len()) as u64)
    }

    async fn workers(
        &self,
        queue: QueueName,
        active_since: DateTime<Utc>,
    ) -> QueueResult<WorkerCounts> {
        let inner = self.inner.lock();
        let Some(workers) = inner.workers.get(&queue) else {
            return Ok(WorkerCounts::default());
        };
        Ok(WorkerCounts {
            total: workers.len() as u64,
            active: workers.values().filter(|seen| **seen >= active_since).count() as u64,
        })
    }

    async fn last_processed(&self, queue: QueueName) -> QueueResult<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().last_processed.get(&queue).copied())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
