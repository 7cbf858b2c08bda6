//! The queue manager: the one entry point for producers, workers and admin
//! tooling.
//!
//! The manager holds configuration and a store handle, nothing else. Every
//! state change it makes is a guarded compare-and-move in the store, so any
//! number of managers, in any number of processes, may share one store.

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{
    Job, JobData, JobId, JobStatus, JobStatusInfo, Priority, QueueName, TranslationPayload,
    VideoPayload,
};
use crate::stats::{
    HealthReport, HealthThresholds, QueueHealth, QueueHealthDetails, QueueStats, classify,
};
use crate::store::{
    GuardOutcome, MemoryStore, QueueStore, RedisStore, WorkerCounts, before, offset,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Workers silent for this many worker TTLs are dropped from the registry.
const WORKER_EXPIRY_FACTOR: u32 = 10;

/// Why a leased job did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Handler asked for another attempt
    Retryable,
    /// Handler declared the job unrecoverable
    Fatal,
    /// Handler exceeded its time budget
    Timeout,
    /// No handler registered for the job type
    UnknownJobType,
    /// The lease ran out without a heartbeat
    LeaseExpired,
}

struct ManagerInner {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
}

/// Job queue manager.
///
/// Cheap to clone; clones share the store handle.
#[derive(Clone)]
pub struct JobQueueManager {
    inner: Arc<ManagerInner>,
}

impl JobQueueManager {
    /// Create a manager over an existing store.
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        info!(backend = store.backend(), prefix = %config.key_prefix, "Job queue manager ready");
        Self {
            inner: Arc::new(ManagerInner { store, config }),
        }
    }

    /// Create a manager over a fresh in-memory store.
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Connect to the Redis server named in `config`.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        let store = RedisStore::connect(&config).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Active configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn store(&self) -> &dyn QueueStore {
        self.inner.store.as_ref()
    }

    // ---------------------------------------------------------------------
    // Producers
    // ---------------------------------------------------------------------

    /// Enqueue a translation of one entity.
    pub async fn enqueue_translation_job(
        &self,
        entity_type: &str,
        entity_id: &str,
        source_lang: &str,
        target_lang: &str,
        priority: Priority,
    ) -> QueueResult<JobId> {
        let payload = TranslationPayload {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
        };
        let job = self.build(
            QueueName::Translations,
            entity_type,
            serde_json::to_value(payload)?,
            priority,
        );
        self.enqueue(job).await
    }

    /// Enqueue a video pipeline step.
    pub async fn enqueue_video_job(
        &self,
        job_type: &str,
        video_id: &str,
        priority: Priority,
    ) -> QueueResult<JobId> {
        let payload = VideoPayload {
            video_id: video_id.to_string(),
        };
        let job = self.build(
            QueueName::VideoProcessing,
            job_type,
            serde_json::to_value(payload)?,
            priority,
        );
        self.enqueue(job).await
    }

    /// Enqueue an agent task with a free-form payload.
    pub async fn enqueue_agent_job(
        &self,
        job_type: &str,
        payload: JobData,
        priority: Priority,
    ) -> QueueResult<JobId> {
        let job = self.build(QueueName::AgentTasks, job_type, payload, priority);
        self.enqueue(job).await
    }

    /// Enqueue a prepared job on its own queue.
    ///
    /// The job is reset to a fresh pending record under a newly assigned id;
    /// its `max_attempts` is kept.
    pub async fn enqueue(&self, mut job: Job) -> QueueResult<JobId> {
        job.id = JobId::new_v4();
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.progress = 0;
        job.error_msg = None;
        job.started_at = None;
        job.completed_at = None;

        self.store().insert(&job).await?;

        debug!(
            job_id = %job.id,
            queue = %job.queue_name,
            job_type = %job.job_type,
            priority = %job.priority,
            "Enqueued job"
        );
        Ok(job.id)
    }

    fn build(&self, queue: QueueName, job_type: &str, payload: JobData, priority: Priority) -> Job {
        Job::new(queue, job_type, payload)
            .with_priority(priority)
            .with_max_attempts(self.inner.config.max_attempts_for(queue))
    }

    // ---------------------------------------------------------------------
    // Admin
    // ---------------------------------------------------------------------

    /// One page of jobs of a queue, optionally filtered by status, plus the
    /// total number matching the filter.
    ///
    /// Pages are 1-indexed; page 0 is read as page 1. Without a filter the
    /// sets are concatenated in [`JobStatus::ALL`] order.
    pub async fn get_jobs(
        &self,
        queue: QueueName,
        status: Option<JobStatus>,
        page: u64,
        limit: u64,
    ) -> QueueResult<(Vec<JobStatusInfo>, u64)> {
        let limit = limit.clamp(1, self.inner.config.max_page_size.max(1));
        let mut skip = (page.max(1) - 1).saturating_mul(limit);

        let statuses: &[JobStatus] = match &status {
            Some(status) => std::slice::from_ref(status),
            None => &JobStatus::ALL,
        };

        let mut jobs = Vec::new();
        let mut total = 0;

        for &status in statuses {
            let count = self.store().count(queue, status).await?;
            total += count;

            let wanted = limit - jobs.len() as u64;
            if wanted == 0 {
                continue;
            }
            if skip >= count {
                skip -= count;
                continue;
            }

            let chunk = self.store().list(queue, status, skip, wanted).await?;
            skip = 0;
            jobs.extend(chunk.iter().map(JobStatusInfo::from));
        }

        Ok((jobs, total))
    }

    /// Admin view of one job.
    pub async fn get_job_status(&self, id: JobId) -> QueueResult<JobStatusInfo> {
        self.get_job(id).await.map(|job| job.status_info())
    }

    /// Full record of one job, payload included.
    pub async fn get_job(&self, id: JobId) -> QueueResult<Job> {
        self.store()
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Send a failed or dead job back to pending on its own queue.
    ///
    /// The attempt counter is kept; `completed_at` is cleared for the new
    /// lifecycle.
    pub async fn retry_job(&self, id: JobId) -> QueueResult<()> {
        let mut job = self.get_job(id).await?;
        let from = job.status;
        if !matches!(from, JobStatus::Failed | JobStatus::Dead) {
            return Err(QueueError::InvalidState(format!(
                "job {} is {}; only failed or dead jobs can be retried",
                id, from
            )));
        }

        job.resurrect();
        if !self.store().transition(&job, from, None).await? {
            return Err(QueueError::Conflict(format!(
                "job {} changed state during retry",
                id
            )));
        }

        info!(job_id = %id, queue = %job.queue_name, attempts = job.attempts, "Job resubmitted");
        Ok(())
    }

    /// Delete a job that is not currently processing.
    pub async fn delete_job(&self, id: JobId) -> QueueResult<()> {
        match self.store().remove(id).await? {
            GuardOutcome::Applied => {
                info!(job_id = %id, "Job deleted");
                Ok(())
            }
            GuardOutcome::NotFound => Err(QueueError::NotFound(id.to_string())),
            GuardOutcome::WrongState => Err(QueueError::Conflict(
                "cannot delete a job that is currently processing".to_string(),
            )),
        }
    }

    /// Delete terminal jobs completed more than `older_than_hours` ago.
    ///
    /// Pending, processing and retrying jobs are never touched.
    pub async fn cleanup_old_jobs(
        &self,
        older_than_hours: u64,
        queue: Option<QueueName>,
    ) -> QueueResult<u64> {
        let age = std::time::Duration::from_secs(older_than_hours.saturating_mul(3600));
        let cutoff = before(Utc::now(), age);

        let queues = match queue {
            Some(queue) => vec![queue],
            None => QueueName::ALL.to_vec(),
        };

        let mut removed = 0;
        for queue in queues {
            removed += self.purge_before(queue, cutoff).await?;
        }

        info!(older_than_hours, removed, "Cleaned up old jobs");
        Ok(removed)
    }

    async fn purge_before(
        &self,
        queue: QueueName,
        cutoff: chrono::DateTime<Utc>,
    ) -> QueueResult<u64> {
        let batch = self.inner.config.batch_size.max(1);
        let mut removed = 0;

        for status in JobStatus::TERMINAL {
            loop {
                let purged = self.store().purge(queue, status, cutoff, batch).await?;
                removed += purged;
                if purged < batch as u64 {
                    break;
                }
            }
        }

        Ok(removed)
    }

    /// Set the progress of a processing job, clamped to 100.
    pub async fn update_progress(&self, id: JobId, progress: u8) -> QueueResult<()> {
        match self.store().set_progress(id, progress.min(100)).await? {
            GuardOutcome::Applied => Ok(()),
            GuardOutcome::NotFound => Err(QueueError::NotFound(id.to_string())),
            GuardOutcome::WrongState => Err(QueueError::InvalidState(format!(
                "job {} is not processing",
                id
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // Stats and health
    // ---------------------------------------------------------------------

    /// Counts per status of one queue.
    pub async fn queue_stats(&self, queue: QueueName) -> QueueResult<QueueStats> {
        let mut stats = QueueStats::default();
        for status in JobStatus::ALL {
            stats.record(status, self.store().count(queue, status).await?);
        }
        Ok(stats)
    }

    /// Counts per status of every queue.
    pub async fn get_queue_stats(&self) -> QueueResult<HashMap<QueueName, QueueStats>> {
        let mut all = HashMap::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            all.insert(queue, self.queue_stats(queue).await?);
        }
        Ok(all)
    }

    /// Liveness of every queue.
    pub async fn get_health_status(&self) -> QueueResult<HealthReport> {
        self.store().ping().await?;

        let now = Utc::now();
        let config = &self.inner.config;
        let thresholds = HealthThresholds {
            stall_threshold: config.stall_threshold,
            backlog_threshold: config.backlog_threshold,
        };

        let mut queues = BTreeMap::new();
        for queue in QueueName::ALL {
            let workers = self.workers(queue).await?;
            let store = self.store();

            let mut details = QueueHealthDetails {
                status: QueueHealth::Healthy,
                worker_count: workers.total,
                active_workers: workers.active,
                pending_jobs: store.count(queue, JobStatus::Pending).await?,
                processing_jobs: store.count(queue, JobStatus::Processing).await?,
                failed_jobs: store.count(queue, JobStatus::Failed).await?
                    + store.count(queue, JobStatus::Dead).await?,
                last_processed: store.last_processed(queue).await?,
            };
            details.status = classify(&details, &thresholds, now);
            queues.insert(queue, details);
        }

        Ok(HealthReport::new(queues, now))
    }

    /// Check store connectivity.
    pub async fn ping(&self) -> QueueResult<()> {
        self.store().ping().await
    }

    // ---------------------------------------------------------------------
    // Workers
    // ---------------------------------------------------------------------

    /// Lease the next pending job of `queue`.
    pub async fn lease(&self, queue: QueueName) -> QueueResult<Option<Job>> {
        let leased = self
            .store()
            .lease(queue, Utc::now(), self.inner.config.lease_ttl)
            .await?;

        if let Some(job) = &leased {
            debug!(job_id = %job.id, queue = %queue, attempt = job.attempts, "Leased job");
        }
        Ok(leased)
    }

    /// Extend the lease on `job`. Returns false once the lease is lost.
    pub async fn renew_lease(&self, job: &Job) -> QueueResult<bool> {
        let deadline = offset(Utc::now(), self.inner.config.lease_ttl);
        self.store().renew_lease(job, deadline).await
    }

    /// Record a successful run. Returns false if the lease was lost first.
    pub async fn report_success(&self, job: &Job) -> QueueResult<bool> {
        let mut done = job.clone();
        done.mark_completed(Utc::now());

        let landed = self
            .store()
            .transition(&done, JobStatus::Processing, None)
            .await?;
        if landed {
            debug!(job_id = %job.id, queue = %job.queue_name, "Job completed");
        } else {
            warn!(job_id = %job.id, queue = %job.queue_name, "Completion discarded, lease lost");
        }
        Ok(landed)
    }

    /// Record a failed run and move the job on.
    ///
    /// Returns the status the job moved to, or `None` if its lease was lost
    /// before the outcome landed.
    pub async fn report_failure(
        &self,
        job: &Job,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> QueueResult<Option<JobStatus>> {
        let message = message.into();
        let now = Utc::now();
        let mut next = job.clone();
        let mut ready_at = None;

        match kind {
            FailureKind::UnknownJobType => next.mark_dead(message.clone(), now),
            FailureKind::Fatal => next.mark_failed(message.clone(), now),
            FailureKind::Retryable if job.can_retry() => {
                let delay = self.inner.config.backoff.delay_for_attempt(job.attempts);
                next.mark_retrying(message.clone());
                ready_at = Some(offset(now, delay));
            }
            FailureKind::Timeout | FailureKind::LeaseExpired if job.can_retry() => {
                next.error_msg = Some(message.clone());
                next.requeue();
            }
            _ => next.mark_dead(message.clone(), now),
        }

        let landed = self
            .store()
            .transition(&next, JobStatus::Processing, ready_at)
            .await?;
        if !landed {
            warn!(job_id = %job.id, queue = %job.queue_name, ?kind, "Failure discarded, lease lost");
            return Ok(None);
        }

        match next.status {
            JobStatus::Dead | JobStatus::Failed => warn!(
                job_id = %job.id,
                queue = %job.queue_name,
                status = %next.status,
                attempts = job.attempts,
                error = %message,
                "Job gave up"
            ),
            _ => debug!(
                job_id = %job.id,
                queue = %job.queue_name,
                status = %next.status,
                attempts = job.attempts,
                error = %message,
                "Job will be retried"
            ),
        }
        Ok(Some(next.status))
    }

    /// Return jobs with expired leases to pending, or dead-letter them once
    /// their budget is spent. Returns the number of jobs moved.
    pub async fn recover_expired_leases(&self, queue: QueueName) -> QueueResult<u64> {
        let batch = self.inner.config.batch_size.max(1);
        let mut recovered = 0;

        loop {
            let expired = self
                .store()
                .due(queue, JobStatus::Processing, Utc::now(), batch)
                .await?;
            let found = expired.len();

            for job in expired {
                if self
                    .report_failure(&job, FailureKind::LeaseExpired, "lease expired")
                    .await?
                    .is_some()
                {
                    recovered += 1;
                }
            }

            if found < batch {
                break;
            }
        }

        if recovered > 0 {
            info!(queue = %queue, recovered, "Recovered expired leases");
        }
        Ok(recovered)
    }

    /// Move retrying jobs whose backoff has elapsed back to pending.
    pub async fn promote_due_retries(&self, queue: QueueName) -> QueueResult<u64> {
        let batch = self.inner.config.batch_size.max(1);
        let mut promoted = 0;

        loop {
            let due = self
                .store()
                .due(queue, JobStatus::Retrying, Utc::now(), batch)
                .await?;
            let found = due.len();

            for mut job in due {
                job.requeue();
                if self
                    .store()
                    .transition(&job, JobStatus::Retrying, None)
                    .await?
                {
                    promoted += 1;
                }
            }

            if found < batch {
                break;
            }
        }

        if promoted > 0 {
            debug!(queue = %queue, promoted, "Promoted due retries");
        }
        Ok(promoted)
    }

    /// Drop terminal jobs older than the configured retention time.
    pub async fn sweep_retention(&self, queue: QueueName) -> QueueResult<u64> {
        let cutoff = before(Utc::now(), self.inner.config.retention_time);

        let removed = self.purge_before(queue, cutoff).await?;
        if removed > 0 {
            info!(queue = %queue, removed, "Retention sweep removed jobs");
        }
        Ok(removed)
    }

    /// Announce a worker of `queue`.
    pub async fn register_worker(&self, queue: QueueName, worker_id: &str) -> QueueResult<()> {
        debug!(queue = %queue, worker_id = %worker_id, "Worker registered");
        self.heartbeat_worker(queue, worker_id).await
    }

    /// Refresh a worker's liveness.
    pub async fn heartbeat_worker(&self, queue: QueueName, worker_id: &str) -> QueueResult<()> {
        self.store().touch_worker(queue, worker_id, Utc::now()).await
    }

    /// Remove a worker from the liveness registry.
    pub async fn deregister_worker(&self, queue: QueueName, worker_id: &str) -> QueueResult<()> {
        debug!(queue = %queue, worker_id = %worker_id, "Worker deregistered");
        self.store().remove_worker(queue, worker_id).await
    }

    /// Forget workers that have been silent for many worker TTLs.
    pub async fn prune_workers(&self, queue: QueueName) -> QueueResult<u64> {
        let horizon = self
            .inner
            .config
            .worker_ttl
            .saturating_mul(WORKER_EXPIRY_FACTOR);
        self.store()
            .prune_workers(queue, before(Utc::now(), horizon))
            .await
    }

    /// Registered and active workers of `queue`.
    pub async fn workers(&self, queue: QueueName) -> QueueResult<WorkerCounts> {
        let active_since = before(Utc::now(), self.inner.config.worker_ttl);
        self.store().workers(queue, active_since).await
    }
}
