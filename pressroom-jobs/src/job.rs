//! Job records, priorities, queue names and lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job unique identifier.
pub type JobId = Uuid;

/// Job payload, passed verbatim to the handler.
pub type JobData = serde_json::Value;

/// Attempt budget used when neither the caller nor the queue config sets one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The closed set of named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// AI translation of articles, categories, pages.
    Translations,
    /// Transcoding, thumbnailing, content analysis.
    VideoProcessing,
    /// Scheduled or triggered automation tasks.
    AgentTasks,
    /// Everything else.
    General,
}

impl QueueName {
    /// Every queue, in a stable order.
    pub const ALL: [QueueName; 4] = [
        QueueName::Translations,
        QueueName::VideoProcessing,
        QueueName::AgentTasks,
        QueueName::General,
    ];

    /// Wire and storage name of the queue.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Translations => "translations",
            QueueName::VideoProcessing => "video_processing",
            QueueName::AgentTasks => "agent_tasks",
            QueueName::General => "general",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|queue| queue.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {}", s))
    }
}

/// Job priority levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Leased after everything else
    Low = 0,
    /// Normal priority (default)
    #[default]
    Normal = 1,
    /// Leased first
    High = 2,
}

impl Priority {
    /// Storage name of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    /// Ordering band inside a pending set; lower bands are leased first.
    pub(crate) fn band(&self) -> i64 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Job lifecycle status. Each status maps to exactly one store set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be leased
    Pending,
    /// Leased by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Rejected by its handler as unrecoverable
    Failed,
    /// Waiting out a backoff before returning to pending
    Retrying,
    /// Retry budget exhausted or no handler registered
    Dead,
}

impl JobStatus {
    /// Every status, in listing order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    /// Statuses eligible for cleanup and operator retry bookkeeping.
    pub const TERMINAL: [JobStatus; 3] = [JobStatus::Completed, JobStatus::Failed, JobStatus::Dead];

    /// Storage name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Dead => "dead",
        }
    }

    /// Whether no automatic transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dead
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// A job to be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Queue whose workers may lease the job
    pub queue_name: QueueName,

    /// Handler discriminator within the queue
    pub job_type: String,

    /// Job priority
    pub priority: Priority,

    /// Producer-defined payload
    pub payload: JobData,

    /// Current lifecycle status
    pub status: JobStatus,

    /// Number of leases taken so far
    pub attempts: u32,

    /// Lease budget before the job is dead-lettered
    pub max_attempts: u32,

    /// Progress percentage (0-100)
    pub progress: u8,

    /// Last failure reason
    pub error_msg: Option<String>,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the job was last leased
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(queue_name: QueueName, job_type: impl Into<String>, payload: JobData) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_name,
            job_type: job_type.into(),
            priority: Priority::default(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            progress: 0,
            error_msg: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set job priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the lease budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether a failed attempt may be followed by another lease.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Apply a lease: processing, stamped, one more attempt.
    pub fn start_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.attempts += 1;
        self.progress = 0;
    }

    /// Successful completion.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.error_msg = None;
        self.completed_at.get_or_insert(now);
    }

    /// Unrecoverable handler failure.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_msg = Some(error.into());
        self.completed_at.get_or_insert(now);
    }

    /// Dead-letter the job.
    pub fn mark_dead(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Dead;
        self.error_msg = Some(error.into());
        self.completed_at.get_or_insert(now);
    }

    /// Park the job until its backoff elapses.
    pub fn mark_retrying(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Retrying;
        self.error_msg = Some(error.into());
    }

    /// Return the job to pending after a backoff or a lost lease.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = 0;
    }

    /// Operator retry of a terminal job. Starts a new lifecycle without
    /// touching the attempt counter.
    pub fn resurrect(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.completed_at = None;
    }

    /// Admin view of the job.
    pub fn status_info(&self) -> JobStatusInfo {
        JobStatusInfo::from(self)
    }
}

/// Job status as reported to admin tooling. Everything but the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusInfo {
    pub id: JobId,
    pub queue_name: QueueName,
    pub job_type: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusInfo {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue_name: job.queue_name,
            job_type: job.job_type.clone(),
            priority: job.priority,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            progress: job.progress,
            error_msg: job.error_msg.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Payload of a `translations` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationPayload {
    pub entity_type: String,
    pub entity_id: String,
    pub source_lang: String,
    pub target_lang: String,
}

/// Payload of a `video_processing` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPayload {
    pub video_id: String,
}
