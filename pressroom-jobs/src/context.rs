//! What a handler sees of the job it runs.

use crate::error::{HandlerError, QueueResult};
use crate::job::{Job, JobData, JobId};
use crate::manager::JobQueueManager;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

/// Execution context handed to a job handler.
///
/// Carries a snapshot of the leased job, a progress reporter and a
/// cancellation signal raised on timeout, lost lease or pool shutdown.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    manager: JobQueueManager,
    cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub(crate) fn new(job: Job, manager: JobQueueManager, cancel: watch::Receiver<bool>) -> Self {
        Self {
            job,
            manager,
            cancel,
        }
    }

    /// The job as leased.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn payload(&self) -> &JobData {
        &self.job.payload
    }

    /// 1-based number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    /// Decode the payload. A payload of the wrong shape is a fatal failure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// Report progress (0-100).
    pub async fn set_progress(&self, progress: u8) -> QueueResult<()> {
        self.manager.update_progress(self.job.id, progress).await
    }

    /// Whether the worker has given up on this run.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve once the worker gives up on this run.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        while !*cancel.borrow_and_update() {
            if cancel.changed().await.is_err() {
                // Sender gone without cancelling: the run can no longer be cancelled.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::{QueueName, TranslationPayload, VideoPayload};
    use serde_json::json;
    use std::time::Duration;

    fn context(payload: JobData) -> (JobContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let job = Job::new(QueueName::Translations, "article", payload);
        let manager = JobQueueManager::in_memory(QueueConfig::default());
        (JobContext::new(job, manager, rx), tx)
    }

    #[test]
    fn test_payload_as_typed() {
        let (ctx, _tx) = context(json!({
            "entity_type": "article",
            "entity_id": "a-1",
            "source_lang": "en",
            "target_lang": "es"
        }));

        let payload: TranslationPayload = ctx.payload_as().unwrap();
        assert_eq!(payload.target_lang, "es");
    }

    #[test]
    fn test_payload_as_wrong_shape_is_fatal() {
        let (ctx, _tx) = context(json!({"entity_id": 7}));
        let err = ctx.payload_as::<VideoPayload>().unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_cancellation_signal() {
        let (ctx, tx) = context(json!({}));
        assert!(!ctx.is_cancelled());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
    }
}
