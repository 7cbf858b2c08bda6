//! Integration tests for pressroom-jobs
//!
//! Every scenario runs against the in-memory store. The Redis variants use
//! `REDIS_URL` (default `redis://localhost:6379`) and a fresh key prefix.

use pressroom_jobs::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn config() -> QueueConfig {
    QueueConfig::default().with_backoff(BackoffPolicy::constant(Duration::ZERO))
}

fn memory(config: QueueConfig) -> JobQueueManager {
    JobQueueManager::in_memory(config)
}

async fn redis(config: QueueConfig) -> JobQueueManager {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let mut config = config.with_key_prefix(format!("pressroom:test:{}", uuid::Uuid::new_v4()));
    config.redis_url = url;
    JobQueueManager::connect(config).await.unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

async fn no_duplicate_leasing(manager: JobQueueManager) {
    for n in 0..60 {
        manager
            .enqueue(Job::new(QueueName::General, "reindex", json!({ "n": n })))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let mut leased = Vec::new();
            while let Some(job) = manager.lease(QueueName::General).await.unwrap() {
                assert_eq!(job.status, JobStatus::Processing);
                leased.push(job.id);
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job {} leased twice", id);
        }
    }

    assert_eq!(seen.len(), 60);
    let stats = manager.queue_stats(QueueName::General).await.unwrap();
    assert_eq!(stats.processing, 60);
    assert_eq!(stats.pending, 0);
}

async fn priority_order(manager: JobQueueManager) {
    let a = manager
        .enqueue_agent_job("a", json!({}), Priority::Normal)
        .await
        .unwrap();
    let b = manager
        .enqueue_agent_job("b", json!({}), Priority::High)
        .await
        .unwrap();
    let c = manager
        .enqueue_agent_job("c", json!({}), Priority::Normal)
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = manager.lease(QueueName::AgentTasks).await.unwrap() {
        order.push(job.id);
    }

    assert_eq!(order, vec![b, a, c]);
}

async fn retry_budget(manager: JobQueueManager) {
    let id = manager
        .enqueue(Job::new(QueueName::Translations, "article", json!({})).with_max_attempts(3))
        .await
        .unwrap();

    let mut path = vec![manager.get_job_status(id).await.unwrap().status];
    loop {
        let job = match manager.lease(QueueName::Translations).await.unwrap() {
            Some(job) => job,
            None => break,
        };
        path.push(job.status);

        let next = manager
            .report_failure(&job, FailureKind::Retryable, "model unavailable")
            .await
            .unwrap()
            .unwrap();
        path.push(next);

        if next == JobStatus::Retrying {
            assert_eq!(manager.promote_due_retries(QueueName::Translations).await.unwrap(), 1);
            path.push(manager.get_job_status(id).await.unwrap().status);
        }
    }

    use JobStatus::*;
    assert_eq!(
        path,
        vec![Pending, Processing, Retrying, Pending, Processing, Retrying, Pending, Processing, Dead]
    );

    let job = manager.get_job_status(id).await.unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_msg.as_deref(), Some("model unavailable"));
    assert!(job.completed_at.is_some());
    assert!(manager.lease(QueueName::Translations).await.unwrap().is_none());
}

async fn delete_guard(manager: JobQueueManager) {
    let id = manager
        .enqueue_video_job("transcode", "v-1", Priority::Normal)
        .await
        .unwrap();
    let job = manager.lease(QueueName::VideoProcessing).await.unwrap().unwrap();

    let err = manager.delete_job(id).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));
    let untouched = manager.get_job(id).await.unwrap();
    assert_eq!(untouched.status, JobStatus::Processing);
    assert_eq!(untouched.attempts, 1);

    assert!(manager.report_success(&job).await.unwrap());
    manager.delete_job(id).await.unwrap();
    assert!(matches!(
        manager.get_job_status(id).await.unwrap_err(),
        QueueError::NotFound(_)
    ));
}

async fn cleanup_keeps_live_jobs(manager: JobQueueManager) {
    let pending = manager
        .enqueue_agent_job("digest", json!({}), Priority::Low)
        .await
        .unwrap();
    let processing = manager
        .enqueue_agent_job("digest", json!({}), Priority::High)
        .await
        .unwrap();
    let completed = manager
        .enqueue_agent_job("digest", json!({}), Priority::High)
        .await
        .unwrap();

    let first = manager.lease(QueueName::AgentTasks).await.unwrap().unwrap();
    assert_eq!(first.id, processing);
    let second = manager.lease(QueueName::AgentTasks).await.unwrap().unwrap();
    assert_eq!(second.id, completed);
    assert!(manager.report_success(&second).await.unwrap());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let removed = manager.cleanup_old_jobs(0, None).await.unwrap();
    assert_eq!(removed, 1);

    assert_eq!(
        manager.get_job_status(pending).await.unwrap().status,
        JobStatus::Pending
    );
    assert_eq!(
        manager.get_job_status(processing).await.unwrap().status,
        JobStatus::Processing
    );
    assert!(manager.get_job_status(completed).await.is_err());
}

async fn dead_job_resurrection(manager: JobQueueManager) {
    let id = manager
        .enqueue(Job::new(QueueName::General, "sitemap", json!({})).with_max_attempts(1))
        .await
        .unwrap();

    let job = manager.lease(QueueName::General).await.unwrap().unwrap();
    let status = manager
        .report_failure(&job, FailureKind::Retryable, "disk full")
        .await
        .unwrap();
    assert_eq!(status, Some(JobStatus::Dead));

    manager.retry_job(id).await.unwrap();
    let info = manager.get_job_status(id).await.unwrap();
    assert_eq!(info.status, JobStatus::Pending);
    assert!(info.completed_at.is_none());

    let again = manager.lease(QueueName::General).await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert!(manager.report_success(&again).await.unwrap());

    let info = manager.get_job_status(id).await.unwrap();
    assert_eq!(info.status, JobStatus::Completed);
    assert!(info.error_msg.is_none());
}

async fn expired_lease_recovery(manager: JobQueueManager) {
    let id = manager
        .enqueue_video_job("thumbnail_generate", "v-9", Priority::Normal)
        .await
        .unwrap();
    let stale = manager.lease(QueueName::VideoProcessing).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        manager.recover_expired_leases(QueueName::VideoProcessing).await.unwrap(),
        1
    );
    assert_eq!(
        manager.get_job_status(id).await.unwrap().status,
        JobStatus::Pending
    );

    let fresh = manager.lease(QueueName::VideoProcessing).await.unwrap().unwrap();
    assert_eq!(fresh.attempts, 2);

    // The first holder lost its lease; its outcome must not land.
    assert!(!manager.report_success(&stale).await.unwrap());
    assert!(manager.report_success(&fresh).await.unwrap());
    assert_eq!(
        manager.get_job_status(id).await.unwrap().status,
        JobStatus::Completed
    );
}

async fn resubmitted_job_is_a_new_job(manager: JobQueueManager) {
    let job = Job::new(QueueName::Translations, "article", json!({"entity_id": "7"}));

    let first = manager.enqueue(job.clone()).await.unwrap();
    let leased = manager.lease(QueueName::Translations).await.unwrap().unwrap();
    let second = manager.enqueue(job).await.unwrap();
    assert_ne!(first, second);

    let stats = manager.queue_stats(QueueName::Translations).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);

    let next = manager.lease(QueueName::Translations).await.unwrap().unwrap();
    assert_eq!(next.id, second);
    assert_eq!(next.attempts, 1);
    assert!(manager.report_success(&leased).await.unwrap());
    assert_eq!(manager.get_job(first).await.unwrap().attempts, 1);
}

async fn worker_pool_end_to_end(manager: JobQueueManager) {
    let mut registry = HandlerRegistry::new();
    registry.register(QueueName::Translations, "article", |ctx| async move {
        let request: TranslationPayload = ctx.payload_as()?;
        ctx.set_progress(50).await?;
        if request.target_lang == "xx" {
            return Err(HandlerError::fatal("unsupported language"));
        }
        Ok(())
    });

    let ok = manager
        .enqueue_translation_job("article", "a-1", "en", "fr", Priority::Normal)
        .await
        .unwrap();
    let bad = manager
        .enqueue_translation_job("article", "a-2", "en", "xx", Priority::Normal)
        .await
        .unwrap();
    let unknown = manager
        .enqueue_translation_job("glossary", "g-1", "en", "de", Priority::Normal)
        .await
        .unwrap();

    let config = WorkerConfig::default()
        .with_concurrency(2)
        .with_poll_interval(Duration::from_millis(10));
    let mut pool = WorkerPool::new(
        manager.clone(),
        QueueName::Translations,
        Arc::new(registry),
        config,
    );
    pool.start().await.unwrap();

    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = manager.queue_stats(QueueName::Translations).await.unwrap();
            if stats.completed + stats.failed + stats.dead == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok());
    pool.shutdown().await.unwrap();

    let ok = manager.get_job_status(ok).await.unwrap();
    assert_eq!(ok.status, JobStatus::Completed);
    assert_eq!(ok.progress, 100);

    let bad = manager.get_job_status(bad).await.unwrap();
    assert_eq!(bad.status, JobStatus::Failed);
    assert_eq!(bad.attempts, 1);
    assert_eq!(bad.error_msg.as_deref(), Some("unsupported language"));

    let unknown = manager.get_job_status(unknown).await.unwrap();
    assert_eq!(unknown.status, JobStatus::Dead);
    assert_eq!(unknown.attempts, 1);
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_duplicate_leasing() {
    no_duplicate_leasing(memory(config())).await;
}

#[tokio::test]
async fn test_priority_order() {
    priority_order(memory(config())).await;
}

#[tokio::test]
async fn test_retry_budget() {
    retry_budget(memory(config())).await;
}

#[tokio::test]
async fn test_delete_guard() {
    delete_guard(memory(config())).await;
}

#[tokio::test]
async fn test_cleanup_keeps_live_jobs() {
    cleanup_keeps_live_jobs(memory(config())).await;
}

#[tokio::test]
async fn test_dead_job_resurrection() {
    dead_job_resurrection(memory(config())).await;
}

#[tokio::test]
async fn test_expired_lease_recovery() {
    expired_lease_recovery(memory(config().with_lease_ttl(Duration::from_millis(50)))).await;
}

#[tokio::test]
async fn test_resubmitted_job_is_a_new_job() {
    resubmitted_job_is_a_new_job(memory(config())).await;
}

#[tokio::test]
async fn test_worker_pool_end_to_end() {
    worker_pool_end_to_end(memory(config())).await;
}

#[tokio::test]
async fn test_admin_service_over_manager() {
    let manager = memory(config());
    let admin = AdminService::new(manager.clone());

    let id = manager
        .enqueue(Job::new(QueueName::General, "sitemap", json!({})).with_max_attempts(1))
        .await
        .unwrap();
    let job = manager.lease(QueueName::General).await.unwrap().unwrap();
    manager
        .report_failure(&job, FailureKind::Fatal, "bad sitemap")
        .await
        .unwrap();

    let page = admin
        .jobs(admin::JobsQuery {
            queue: QueueName::General,
            status: Some(JobStatus::Failed),
            page: 1,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.jobs[0].id, id);

    admin.retry(id).await.unwrap();
    assert_eq!(
        admin.job_status(id).await.unwrap().status,
        JobStatus::Pending
    );
}

// ---------------------------------------------------------------------------
// Redis store
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Redis"]
async fn test_redis_no_duplicate_leasing() {
    no_duplicate_leasing(redis(config()).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_priority_order() {
    priority_order(redis(config()).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_retry_budget() {
    retry_budget(redis(config()).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_delete_guard() {
    delete_guard(redis(config()).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_cleanup_keeps_live_jobs() {
    cleanup_keeps_live_jobs(redis(config()).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_dead_job_resurrection() {
    dead_job_resurrection(redis(config()).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_expired_lease_recovery() {
    expired_lease_recovery(redis(config().with_lease_ttl(Duration::from_millis(50))).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_resubmitted_job_is_a_new_job() {
    resubmitted_job_is_a_new_job(redis(config()).await).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_worker_pool_end_to_end() {
    worker_pool_end_to_end(redis(config()).await).await;
}
