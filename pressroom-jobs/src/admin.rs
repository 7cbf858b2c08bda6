//! Admin wire contract.
//!
//! Request and response bodies for operator dashboards, plus an
//! [`AdminService`] that answers them through a [`JobQueueManager`]. An HTTP
//! layer only has to route, deserialize and map errors with
//! [`ErrorResponse::status_code`].

use crate::error::{QueueError, QueueResult};
use crate::job::{JobId, JobStatus, JobStatusInfo, QueueName};
use crate::manager::JobQueueManager;
use crate::stats::{HealthReport, QueueStats};
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

fn default_page() -> u64 {
    1
}

fn default_limit() -> u64 {
    20
}

/// Read a missing or empty string as `None`.
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// `GET /jobs` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsQuery {
    pub queue: QueueName,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub status: Option<JobStatus>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

/// One page of jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobStatusInfo>,
    pub total_count: u64,
    pub page: u64,
    pub limit: u64,
    pub queue_name: QueueName,
}

/// Health of every queue.
pub type HealthResponse = HealthReport;

/// Counts of every queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub queues: HashMap<QueueName, QueueStats>,
    pub timestamp: DateTime<Utc>,
}

/// `POST /jobs/cleanup` body. An empty queue name means every queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub older_than_hours: u64,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub queue_name: Option<QueueName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub cleaned_count: u64,
}

/// Outcome of retry and delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub job_id: JobId,
    pub message: String,
}

/// Error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip)]
    status: u16,
}

impl ErrorResponse {
    /// HTTP status to answer with.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<&QueueError> for ErrorResponse {
    fn from(err: &QueueError) -> Self {
        Self {
            error: err.to_string(),
            code: err.code().to_string(),
            status: err.status_code().as_u16(),
        }
    }
}

impl From<QueueError> for ErrorResponse {
    fn from(err: QueueError) -> Self {
        Self::from(&err)
    }
}

/// One method per admin endpoint.
#[derive(Clone)]
pub struct AdminService {
    manager: JobQueueManager,
}

impl AdminService {
    pub fn new(manager: JobQueueManager) -> Self {
        Self { manager }
    }

    pub async fn stats(&self) -> QueueResult<StatsResponse> {
        Ok(StatsResponse {
            queues: self.manager.get_queue_stats().await?,
            timestamp: Utc::now(),
        })
    }

    pub async fn health(&self) -> QueueResult<HealthResponse> {
        self.manager.get_health_status().await
    }

    pub async fn jobs(&self, query: JobsQuery) -> QueueResult<JobsResponse> {
        let page = query.page.max(1);
        let limit = query
            .limit
            .clamp(1, self.manager.config().max_page_size.max(1));
        let (jobs, total_count) = self
            .manager
            .get_jobs(query.queue, query.status, page, limit)
            .await?;

        Ok(JobsResponse {
            jobs,
            total_count,
            page,
            limit,
            queue_name: query.queue,
        })
    }

    pub async fn job_status(&self, id: JobId) -> QueueResult<JobStatusInfo> {
        self.manager.get_job_status(id).await
    }

    pub async fn retry(&self, id: JobId) -> QueueResult<ActionResponse> {
        self.manager.retry_job(id).await?;
        Ok(ActionResponse {
            job_id: id,
            message: "job queued for retry".to_string(),
        })
    }

    pub async fn delete(&self, id: JobId) -> QueueResult<ActionResponse> {
        self.manager.delete_job(id).await?;
        Ok(ActionResponse {
            job_id: id,
            message: "job deleted".to_string(),
        })
    }

    pub async fn cleanup(&self, request: CleanupRequest) -> QueueResult<CleanupResponse> {
        let cleaned_count = self
            .manager
            .cleanup_old_jobs(request.older_than_hours, request.queue_name)
            .await?;
        Ok(CleanupResponse { cleaned_count })
    }
}
