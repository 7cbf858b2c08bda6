//! Asynchronous job scheduling for the Pressroom news platform.
//!
//! Provides:
//! - Four named queues (`translations`, `video_processing`, `agent_tasks`, `general`)
//! - Redis-backed persistence with an in-memory store for tests
//! - Strict priority bands with FIFO order inside a band
//! - Leases with heartbeat renewal and a reaper for crashed workers
//! - Bounded retries with exponential backoff and a dead-letter state
//! - Worker pools with graceful shutdown
//! - Stats, health reporting and admin operations
//!
//! ## Creating jobs
//!
//! ```
//! use pressroom_jobs::{Job, JobStatus, Priority, QueueName};
//! use serde_json::json;
//!
//! let job = Job::new(QueueName::General, "sitemap_rebuild", json!({"section": "world"}))
//!     .with_priority(Priority::High)
//!     .with_max_attempts(5);
//!
//! assert_eq!(job.status, JobStatus::Pending);
//! assert_eq!(job.attempts, 0);
//! assert!(Priority::High > Priority::Normal);
//! ```
//!
//! ## Producing and consuming
//!
//! ```
//! use pressroom_jobs::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), QueueError> {
//! let manager = JobQueueManager::in_memory(QueueConfig::default());
//! let id = manager
//!     .enqueue_video_job("thumbnail_generate", "v-42", Priority::High)
//!     .await?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(QueueName::VideoProcessing, "thumbnail_generate", |ctx| async move {
//!     let video: VideoPayload = ctx.payload_as()?;
//!     assert_eq!(video.video_id, "v-42");
//!     Ok(())
//! });
//!
//! let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(10));
//! let mut pool = WorkerPool::new(
//!     manager.clone(),
//!     QueueName::VideoProcessing,
//!     Arc::new(registry),
//!     config,
//! );
//! pool.start().await?;
//!
//! while manager.get_job_status(id).await?.status != JobStatus::Completed {
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//! }
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Against Redis
//!
//! ```no_run
//! use pressroom_jobs::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), QueueError> {
//! let config = SchedulerConfig::from_env()?;
//! let manager = JobQueueManager::connect(config.queue.clone()).await?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(QueueName::Translations, "article", |ctx| async move {
//!     let request: TranslationPayload = ctx.payload_as()?;
//!     tracing::info!(entity_id = %request.entity_id, "translating");
//!     Ok(())
//! });
//!
//! let pools = WorkerPools::start(&manager, Arc::new(registry), &config).await?;
//! tokio::signal::ctrl_c().await.ok();
//! pools.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod manager;
pub mod registry;
pub mod stats;
pub mod store;
pub mod worker;

pub use admin::AdminService;
pub use config::{BackoffPolicy, QueueConfig, SchedulerConfig};
pub use context::JobContext;
pub use error::{HandlerError, HandlerResult, QueueError, QueueResult};
pub use job::{
    DEFAULT_MAX_ATTEMPTS, Job, JobData, JobId, JobStatus, JobStatusInfo, Priority, QueueName,
    TranslationPayload, VideoPayload,
};
pub use manager::{FailureKind, JobQueueManager};
pub use registry::{HandlerRegistry, JobHandler};
pub use stats::{HealthReport, OverallHealth, QueueHealth, QueueHealthDetails, QueueStats};
pub use store::{MemoryStore, QueueStore, RedisStore};
pub use worker::{MaintenanceReport, WorkerConfig, WorkerPool, WorkerPools};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admin::AdminService;
    pub use crate::config::{BackoffPolicy, QueueConfig, SchedulerConfig};
    pub use crate::context::JobContext;
    pub use crate::error::{HandlerError, HandlerResult, QueueError, QueueResult};
    pub use crate::job::{
        Job, JobData, JobId, JobStatus, JobStatusInfo, Priority, QueueName, TranslationPayload,
        VideoPayload,
    };
    pub use crate::manager::JobQueueManager;
    pub use crate::registry::HandlerRegistry;
    pub use crate::stats::{HealthReport, QueueHealth, QueueStats};
    pub use crate::worker::{WorkerConfig, WorkerPool, WorkerPools};
}
