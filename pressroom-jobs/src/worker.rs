//! Worker pools for processing jobs.
//!
//! One [`WorkerPool`] serves one named queue with `concurrency` worker tasks
//! and a maintenance task. Workers lease, dispatch, heartbeat and report;
//! the maintenance task reaps expired leases, promotes due retries, sweeps
//! old terminal jobs and prunes silent workers.

use crate::config::SchedulerConfig;
use crate::context::JobContext;
use crate::error::{HandlerError, QueueError, QueueResult};
use crate::job::{Job, QueueName};
use crate::manager::{FailureKind, JobQueueManager};
use crate::registry::{HandlerRegistry, UNKNOWN_JOB_TYPE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent jobs to process
    pub concurrency: usize,

    /// Wait between lease attempts on an empty queue
    pub poll_interval: Duration,

    /// Timeout for job execution, unless the handler sets its own
    pub job_timeout: Duration,

    /// Lease renewal period while a job runs; must be shorter than the lease TTL
    pub heartbeat_interval: Duration,

    /// Period of the reaper, retry promoter and retention sweep
    pub maintenance_interval: Duration,

    /// How long shutdown waits for in-flight jobs
    pub shutdown_grace: Duration,

    /// Whether to log job execution
    pub log_execution: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            log_execution: true,
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_maintenance_interval(mut self, maintenance_interval: Duration) -> Self {
        self.maintenance_interval = maintenance_interval;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn with_log_execution(mut self, log_execution: bool) -> Self {
        self.log_execution = log_execution;
        self
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub recovered: u64,
    pub promoted: u64,
    pub purged: u64,
    pub pruned_workers: u64,
}

/// Run the periodic upkeep of one queue once.
pub async fn run_maintenance(
    manager: &JobQueueManager,
    queue: QueueName,
) -> QueueResult<MaintenanceReport> {
    Ok(MaintenanceReport {
        recovered: manager.recover_expired_leases(queue).await?,
        promoted: manager.promote_due_retries(queue).await?,
        purged: manager.sweep_retention(queue).await?,
        pruned_workers: manager.prune_workers(queue).await?,
    })
}

/// Pool of workers serving one queue.
pub struct WorkerPool {
    manager: JobQueueManager,
    queue: QueueName,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    pool_id: String,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a stopped pool.
    pub fn new(
        manager: JobQueueManager,
        queue: QueueName,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let mut pool_id = Uuid::new_v4().simple().to_string();
        pool_id.truncate(8);

        Self {
            manager,
            queue,
            registry,
            config,
            pool_id,
            shutdown: None,
            handles: Vec::new(),
        }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Spawn the workers and the maintenance task.
    pub async fn start(&mut self) -> QueueResult<()> {
        if self.shutdown.is_some() {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        let (tx, rx) = watch::channel(false);
        let job_types = self.registry.job_types(self.queue);
        if job_types.is_empty() {
            warn!(queue = %self.queue, "Starting worker pool without handlers");
        }
        info!(
            queue = %self.queue,
            pool = %self.pool_id,
            concurrency = self.config.concurrency,
            job_types = ?job_types,
            "Starting worker pool"
        );

        for index in 0..self.config.concurrency {
            let worker = Worker {
                id: format!("{}:{}:{}", self.queue, self.pool_id, index),
                manager: self.manager.clone(),
                queue: self.queue,
                registry: self.registry.clone(),
                config: self.config.clone(),
            };
            self.handles.push(tokio::spawn(worker.run(rx.clone())));
        }

        self.handles.push(tokio::spawn(maintain(
            self.manager.clone(),
            self.queue,
            self.config.maintenance_interval,
            rx,
        )));

        self.shutdown = Some(tx);
        Ok(())
    }

    /// Stop leasing, let in-flight jobs finish within the grace period, then
    /// abort whatever is left.
    pub async fn shutdown(&mut self) -> QueueResult<()> {
        let Some(tx) = self.shutdown.take() else {
            return Err(QueueError::WorkerNotRunning);
        };

        info!(queue = %self.queue, pool = %self.pool_id, "Stopping worker pool");
        let _ = tx.send(true);

        // Workers abandon jobs on their own once the grace period runs out.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace + Duration::from_secs(1);
        for mut handle in self.handles.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        info!(queue = %self.queue, pool = %self.pool_id, "Worker pool stopped");
        Ok(())
    }

    /// Run one maintenance pass now.
    pub async fn run_maintenance(&self) -> QueueResult<MaintenanceReport> {
        run_maintenance(&self.manager, self.queue).await
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// One pool per queue with a non-zero concurrency.
pub struct WorkerPools {
    pools: Vec<WorkerPool>,
}

impl WorkerPools {
    /// Start a pool for every queue configured with workers.
    pub async fn start(
        manager: &JobQueueManager,
        registry: Arc<HandlerRegistry>,
        config: &SchedulerConfig,
    ) -> QueueResult<Self> {
        let mut pools = Vec::new();

        for queue in QueueName::ALL {
            let workers = config.worker_config(queue);
            if workers.concurrency == 0 {
                debug!(queue = %queue, "No workers configured");
                continue;
            }

            let mut pool = WorkerPool::new(manager.clone(), queue, registry.clone(), workers);
            pool.start().await?;
            pools.push(pool);
        }

        Ok(Self { pools })
    }

    /// Queues being served.
    pub fn queues(&self) -> Vec<QueueName> {
        self.pools.iter().map(WorkerPool::queue).collect()
    }

    /// Stop every pool.
    pub async fn shutdown(mut self) -> QueueResult<()> {
        for pool in &mut self.pools {
            pool.shutdown().await?;
        }
        Ok(())
    }
}

/// How a leased run ended.
enum RunOutcome {
    Finished(Result<(), HandlerError>),
    Panicked(JoinError),
    TimedOut(Duration),
    LeaseLost,
    Abandoned,
}

struct Worker {
    id: String,
    manager: JobQueueManager,
    queue: QueueName,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.manager.register_worker(self.queue, &self.id).await {
            warn!(worker = %self.id, error = %e, "Failed to register worker");
        }

        while !stopping(&shutdown) {
            match self.manager.lease(self.queue).await {
                Ok(Some(job)) => {
                    self.process(job, shutdown.clone()).await;
                    self.heartbeat().await;
                }
                Ok(None) => {
                    self.heartbeat().await;
                    if wait_or_stop(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "Error leasing job");
                    if wait_or_stop(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.manager.deregister_worker(self.queue, &self.id).await {
            warn!(worker = %self.id, error = %e, "Failed to deregister worker");
        }
        debug!(worker = %self.id, "Worker stopped");
    }

    async fn heartbeat(&self) {
        if let Err(e) = self.manager.heartbeat_worker(self.queue, &self.id).await {
            warn!(worker = %self.id, error = %e, "Worker heartbeat failed");
        }
    }

    async fn process(&self, job: Job, shutdown: watch::Receiver<bool>) {
        let log = self.config.log_execution;

        let entry = match self.registry.handler_for(self.queue, &job.job_type) {
            Ok(entry) => entry.clone(),
            Err(e) => {
                warn!(worker = %self.id, job_id = %job.id, error = %e, "No handler for job type");
                self.report(&job, FailureKind::UnknownJobType, UNKNOWN_JOB_TYPE).await;
                return;
            }
        };

        if log {
            info!(
                worker = %self.id,
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                "Processing job"
            );
        }

        let budget = entry.timeout.unwrap_or(self.config.job_timeout);
        let (cancel, cancel_rx) = watch::channel(false);
        let ctx = JobContext::new(job.clone(), self.manager.clone(), cancel_rx);
        let started = Instant::now();

        // Own task, so a panic is contained and a timeout can abort it.
        let mut run = tokio::spawn((entry.handler)(ctx));

        let outcome = tokio::select! {
            finished = tokio::time::timeout(budget, &mut run) => match finished {
                Ok(Ok(result)) => RunOutcome::Finished(result),
                Ok(Err(join_error)) => RunOutcome::Panicked(join_error),
                Err(_) => RunOutcome::TimedOut(budget),
            },
            _ = self.keep_alive(&job) => RunOutcome::LeaseLost,
            _ = grace_expired(shutdown, self.config.shutdown_grace) => RunOutcome::Abandoned,
        };

        if !matches!(outcome, RunOutcome::Finished(_) | RunOutcome::Panicked(_)) {
            let _ = cancel.send(true);
            run.abort();
        }

        let elapsed = started.elapsed();
        match outcome {
            RunOutcome::Finished(Ok(())) => match self.manager.report_success(&job).await {
                Ok(true) if log => {
                    info!(worker = %self.id, job_id = %job.id, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
                }
                Ok(_) => {}
                Err(e) => error!(worker = %self.id, job_id = %job.id, error = %e, "Failed to mark job as complete"),
            },
            RunOutcome::Finished(Err(failure)) => {
                let kind = if failure.is_fatal() {
                    FailureKind::Fatal
                } else {
                    FailureKind::Retryable
                };
                let message = failure.message().to_string();
                let error = QueueError::from(failure);
                warn!(worker = %self.id, job_id = %job.id, error = %error, "Job failed");
                self.report(&job, kind, message).await;
            }
            RunOutcome::Panicked(join_error) => {
                error!(worker = %self.id, job_id = %job.id, error = %join_error, "Job handler panicked");
                self.report(&job, FailureKind::Retryable, "handler panicked").await;
            }
            RunOutcome::TimedOut(budget) => {
                warn!(worker = %self.id, job_id = %job.id, error = %QueueError::Timeout, timeout = ?budget, "Job timed out");
                let message = format!("job timed out after {}s", budget.as_secs_f64());
                self.report(&job, FailureKind::Timeout, message).await;
            }
            RunOutcome::LeaseLost => {
                warn!(worker = %self.id, job_id = %job.id, "Lease lost, abandoning job");
            }
            RunOutcome::Abandoned => {
                warn!(worker = %self.id, job_id = %job.id, "Shutdown grace expired, releasing job");
                self.report(&job, FailureKind::LeaseExpired, "worker shut down before the job finished")
                    .await;
            }
        }
    }

    async fn report(&self, job: &Job, kind: FailureKind, message: impl Into<String>) {
        if let Err(e) = self.manager.report_failure(job, kind, message).await {
            error!(worker = %self.id, job_id = %job.id, error = %e, "Failed to record job failure");
        }
    }

    /// Renew the lease every heartbeat interval. Resolves only once the lease
    /// is lost.
    async fn keep_alive(&self, job: &Job) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            match self.manager.renew_lease(job).await {
                Ok(true) => self.heartbeat().await,
                Ok(false) => return,
                Err(e) => warn!(worker = %self.id, job_id = %job.id, error = %e, "Lease renewal failed"),
            }
        }
    }
}

async fn maintain(
    manager: JobQueueManager,
    queue: QueueName,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match run_maintenance(&manager, queue).await {
            Ok(report) if report != MaintenanceReport::default() => {
                debug!(queue = %queue, ?report, "Maintenance pass");
            }
            Ok(_) => {}
            Err(e) => warn!(queue = %queue, error = %e, "Maintenance pass failed"),
        }

        if wait_or_stop(&mut shutdown, interval).await {
            break;
        }
    }
}

/// A dropped sender counts as a shutdown signal.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `period` unless shutdown arrives first. Returns true to stop.
async fn wait_or_stop(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => stopping(shutdown),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Resolves `grace` after shutdown is signalled.
async fn grace_expired(mut shutdown: watch::Receiver<bool>, grace: Duration) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    tokio::time::sleep(grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffPolicy, QueueConfig};
    use crate::job::{JobId, JobStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Flips the flag when the handler future is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(1)
            .with_poll_interval(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_maintenance_interval(Duration::from_millis(20))
            .with_shutdown_grace(Duration::from_millis(200))
            .with_log_execution(false)
    }

    fn manager() -> JobQueueManager {
        JobQueueManager::in_memory(
            QueueConfig::default().with_backoff(BackoffPolicy::constant(Duration::ZERO)),
        )
    }

    async fn wait_for_status(manager: &JobQueueManager, id: JobId, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = manager.get_job(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[test]
    fn test_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 2);
        assert!(config.heartbeat_interval < QueueConfig::default().lease_ttl);
        assert!(config.log_execution);
    }

    #[tokio::test]
    async fn test_pool_lifecycle_errors() {
        let mut pool = WorkerPool::new(
            manager(),
            QueueName::General,
            Arc::new(HandlerRegistry::new()),
            fast_config(),
        );

        assert!(matches!(pool.shutdown().await, Err(QueueError::WorkerNotRunning)));
        pool.start().await.unwrap();
        assert!(pool.is_running());
        assert!(matches!(pool.start().await, Err(QueueError::WorkerAlreadyRunning)));
        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_pool_processes_jobs() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let calls = calls.clone();
            registry.register(QueueName::General, "sitemap", move |ctx| {
                let calls = calls.clone();
                async move {
                    ctx.set_progress(50).await?;
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let id = manager
            .enqueue(Job::new(QueueName::General, "sitemap", json!({})))
            .await
            .unwrap();
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), fast_config());
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Completed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.attempts, 1);
        assert_eq!(job.progress, 100);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.get_health_status().await.unwrap().queues[&QueueName::General]
            .last_processed
            .is_some());
    }

    #[tokio::test]
    async fn test_unknown_job_type_goes_dead() {
        let manager = manager();
        let id = manager
            .enqueue(Job::new(QueueName::General, "nobody_handles_this", json!({})))
            .await
            .unwrap();
        let mut pool = WorkerPool::new(
            manager.clone(),
            QueueName::General,
            Arc::new(HandlerRegistry::new()),
            fast_config(),
        );
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Dead).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.error_msg.as_deref(), Some(UNKNOWN_JOB_TYPE));
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_until_dead() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let calls = calls.clone();
            registry.register(QueueName::General, "flaky", move |_ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::retryable("upstream unavailable"))
                }
            });
        }

        let id = manager
            .enqueue(Job::new(QueueName::General, "flaky", json!({})).with_max_attempts(3))
            .await
            .unwrap();
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), fast_config());
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Dead).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.error_msg.as_deref(), Some("upstream unavailable"));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register(QueueName::General, "import", |ctx| async move {
            let _: crate::job::VideoPayload = ctx.payload_as()?;
            Ok(())
        });

        let id = manager
            .enqueue(Job::new(QueueName::General, "import", json!({"wrong": true})))
            .await
            .unwrap();
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), fast_config());
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Failed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.attempts, 1);
        assert!(job.error_msg.unwrap().starts_with("invalid payload"));
    }

    #[tokio::test]
    async fn test_timeout_requeues_then_dead() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register_with_timeout(
            QueueName::General,
            "stuck",
            Duration::from_millis(30),
            |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            },
        );

        let id = manager
            .enqueue(Job::new(QueueName::General, "stuck", json!({})).with_max_attempts(2))
            .await
            .unwrap();
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), fast_config());
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Dead).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.attempts, 2);
        assert!(job.error_msg.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let calls = calls.clone();
            registry.register(QueueName::General, "fragile", move |_ctx| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first attempt explodes");
                    }
                    Ok(())
                }
            });
        }

        let id = manager
            .enqueue(Job::new(QueueName::General, "fragile", json!({})))
            .await
            .unwrap();
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), fast_config());
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Completed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.attempts, 2);
        assert!(job.error_msg.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_releases_abandoned_job() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register(QueueName::General, "endless", |_ctx| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        let id = manager
            .enqueue(Job::new(QueueName::General, "endless", json!({})))
            .await
            .unwrap();
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), fast_config());
        pool.start().await.unwrap();

        wait_for_status(&manager, id, JobStatus::Processing).await;
        pool.shutdown().await.unwrap();

        let job = manager.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(manager.workers(QueueName::General).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_long_job_leased() {
        let manager = JobQueueManager::in_memory(
            QueueConfig::default().with_lease_ttl(Duration::from_millis(100)),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let calls = calls.clone();
            registry.register(QueueName::General, "archive", move |_ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok(())
                }
            });
        }

        let id = manager
            .enqueue(Job::new(QueueName::General, "archive", json!({})))
            .await
            .unwrap();
        let config = fast_config().with_heartbeat_interval(Duration::from_millis(25));
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), config);
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Completed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_lease_cancels_handler() {
        let manager = JobQueueManager::in_memory(
            QueueConfig::default().with_lease_ttl(Duration::from_millis(40)),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let mut registry = HandlerRegistry::new();
        {
            let calls = calls.clone();
            let dropped = dropped.clone();
            registry.register(QueueName::General, "rebuild", move |_ctx| {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                let flag = first.then(|| DropFlag(dropped.clone()));
                async move {
                    let _flag = flag;
                    if first {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Ok(())
                }
            });
        }

        let id = manager
            .enqueue(Job::new(QueueName::General, "rebuild", json!({})))
            .await
            .unwrap();
        // Heartbeats come too late, so the reaper takes the lease first.
        let config = fast_config().with_heartbeat_interval(Duration::from_millis(150));
        let mut pool = WorkerPool::new(manager.clone(), QueueName::General, Arc::new(registry), config);
        pool.start().await.unwrap();

        let job = wait_for_status(&manager, id, JobStatus::Completed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(job.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_worker_pools_skip_disabled_queues() {
        let manager = manager();
        let mut config = SchedulerConfig::default();
        for (queue, workers) in config.workers.iter_mut() {
            *workers = fast_config();
            if *queue != QueueName::Translations {
                workers.concurrency = 0;
            }
        }

        let pools = WorkerPools::start(&manager, Arc::new(HandlerRegistry::new()), &config)
            .await
            .unwrap();
        assert_eq!(pools.queues(), vec![QueueName::Translations]);
        pools.shutdown().await.unwrap();
    }
}
