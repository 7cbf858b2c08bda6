//! Handler registry keyed by queue and job type.

use crate::context::JobContext;
use crate::error::{HandlerResult, QueueError, QueueResult};
use crate::job::QueueName;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Error message recorded on jobs whose type has no handler.
pub const UNKNOWN_JOB_TYPE: &str = "unknown job type";

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// A handler and its optional time budget.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: JobHandler,
    /// Overrides the worker's default job timeout
    pub timeout: Option<Duration>,
}

/// Typed table from `(queue, job_type)` to handler.
///
/// Built once at startup and shared read-only by the worker pools.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(QueueName, String), RegisteredHandler>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler.
    ///
    /// # Examples
    ///
    /// ```
    /// use pressroom_jobs::{HandlerError, HandlerRegistry, QueueName, VideoPayload};
    ///
    /// let mut registry = HandlerRegistry::new();
    /// registry.register(QueueName::VideoProcessing, "thumbnail_generate", |ctx| async move {
    ///     let video: VideoPayload = ctx.payload_as()?;
    ///     if video.video_id.is_empty() {
    ///         return Err(HandlerError::fatal("missing video id"));
    ///     }
    ///     Ok(())
    /// });
    ///
    /// assert!(registry.contains(QueueName::VideoProcessing, "thumbnail_generate"));
    /// ```
    pub fn register<F, Fut>(
        &mut self,
        queue: QueueName,
        job_type: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(queue, job_type.into(), handler, None)
    }

    /// Register a job handler with its own time budget.
    pub fn register_with_timeout<F, Fut>(
        &mut self,
        queue: QueueName,
        job_type: impl Into<String>,
        timeout: Duration,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(queue, job_type.into(), handler, Some(timeout))
    }

    fn insert<F, Fut>(
        &mut self,
        queue: QueueName,
        job_type: String,
        handler: F,
        timeout: Option<Duration>,
    ) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let wrapped: JobHandler = Arc::new(
            move |ctx: JobContext| -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> {
                Box::pin(handler(ctx))
            },
        );

        self.handlers.insert(
            (queue, job_type),
            RegisteredHandler {
                handler: wrapped,
                timeout,
            },
        );
        self
    }

    /// Find the handler for a job.
    pub fn lookup(&self, queue: QueueName, job_type: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(&(queue, job_type.to_string()))
    }

    /// Find the handler for a job, or fail with
    /// [`QueueError::UnknownJobType`].
    pub fn handler_for(&self, queue: QueueName, job_type: &str) -> QueueResult<&RegisteredHandler> {
        self.lookup(queue, job_type)
            .ok_or_else(|| QueueError::UnknownJobType(format!("{}/{}", queue, job_type)))
    }

    pub fn contains(&self, queue: QueueName, job_type: &str) -> bool {
        self.lookup(queue, job_type).is_some()
    }

    /// Job types registered for `queue`, sorted.
    pub fn job_types(&self, queue: QueueName) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .handlers
            .keys()
            .filter(|(q, _)| *q == queue)
            .map(|(_, job_type)| job_type.as_str())
            .collect();
        types.sort_unstable();
        types
    }

    /// Queues with at least one handler.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self.handlers.keys().map(|(q, _)| *q).collect();
        queues.sort();
        queues.dedup();
        queues
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;

    #[test]
    fn test_lookup_is_scoped_by_queue() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(QueueName::Translations, "article", |_ctx| async { Ok(()) })
            .register(QueueName::Translations, "category", |_ctx| async { Ok(()) });

        assert!(registry.contains(QueueName::Translations, "article"));
        assert!(!registry.contains(QueueName::General, "article"));
        assert_eq!(
            registry.job_types(QueueName::Translations),
            vec!["article", "category"]
        );
        assert_eq!(registry.queues(), vec![QueueName::Translations]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_timeout_override() {
        let mut registry = HandlerRegistry::new();
        registry.register_with_timeout(
            QueueName::VideoProcessing,
            "transcode",
            Duration::from_secs(3600),
            |_ctx| async { Err(HandlerError::retryable("encoder busy")) },
        );

        let entry = registry
            .lookup(QueueName::VideoProcessing, "transcode")
            .unwrap();
        assert_eq!(entry.timeout, Some(Duration::from_secs(3600)));
        assert!(registry.lookup(QueueName::VideoProcessing, "thumbnail").is_none());
    }

    #[test]
    fn test_handler_for_unknown_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(QueueName::General, "sitemap", |_ctx| async { Ok(()) });

        assert!(registry.handler_for(QueueName::General, "sitemap").is_ok());
        match registry.handler_for(QueueName::General, "rss") {
            Err(QueueError::UnknownJobType(name)) => assert_eq!(name, "general/rss"),
            other => panic!("unexpected lookup result: {:?}", other.map(|entry| entry.timeout)),
        }
    }

    #[test]
    fn test_reregistering_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.register_with_timeout(
            QueueName::General,
            "sitemap",
            Duration::from_secs(5),
            |_ctx| async { Ok(()) },
        );
        registry.register(QueueName::General, "sitemap", |_ctx| async { Ok(()) });

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(QueueName::General, "sitemap").unwrap().timeout.is_none());
    }
}
