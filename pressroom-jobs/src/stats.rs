//! Queue statistics and health classification.

use crate::job::{JobStatus, QueueName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Job counts of one queue, one field per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub total: u64,
}

impl QueueStats {
    /// Add `count` jobs of `status`.
    pub fn record(&mut self, status: JobStatus, count: u64) {
        *self.slot(status) += count;
        self.total += count;
    }

    /// Count for one status.
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Retrying => self.retrying,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Dead => self.dead,
        }
    }

    fn slot(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Dead => &mut self.dead,
        }
    }
}

impl FromIterator<(JobStatus, u64)> for QueueStats {
    fn from_iter<I: IntoIterator<Item = (JobStatus, u64)>>(iter: I) -> Self {
        let mut stats = Self::default();
        for (status, count) in iter {
            stats.record(status, count);
        }
        stats
    }
}

/// Liveness classification of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    /// Workers alive and keeping up
    Healthy,
    /// Backlog above threshold
    Degraded,
    /// Workers registered but silent, or pending work not moving
    Stalled,
    /// No worker registered for the queue
    NoWorkers,
}

/// Health of one queue as reported to admin tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealthDetails {
    pub status: QueueHealth,
    pub worker_count: u64,
    pub active_workers: u64,
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    /// Failed and dead jobs together
    pub failed_jobs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed: Option<DateTime<Utc>>,
}

/// Aggregate health across queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
}

/// Point-in-time health of every queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallHealth,
    pub timestamp: DateTime<Utc>,
    pub queues: BTreeMap<QueueName, QueueHealthDetails>,
}

impl HealthReport {
    /// Build a report, deriving the overall status from the queues.
    pub fn new(queues: BTreeMap<QueueName, QueueHealthDetails>, timestamp: DateTime<Utc>) -> Self {
        let status = overall(queues.values());
        Self {
            status,
            timestamp,
            queues,
        }
    }
}

/// Limits used by [`classify`].
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// Pending work with no completion for this long is stalled
    pub stall_threshold: Duration,
    /// Pending jobs above this count is a degraded backlog
    pub backlog_threshold: u64,
}

/// Classify one queue.
///
/// A queue that has never completed anything is judged on worker liveness
/// and backlog alone.
pub fn classify(
    details: &QueueHealthDetails,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> QueueHealth {
    if details.worker_count == 0 {
        return QueueHealth::NoWorkers;
    }
    if details.active_workers == 0 {
        return QueueHealth::Stalled;
    }

    let silent_for = details
        .last_processed
        .and_then(|at| (now - at).to_std().ok());
    if details.pending_jobs > 0
        && silent_for.is_some_and(|silent| silent > thresholds.stall_threshold)
    {
        return QueueHealth::Stalled;
    }

    if details.pending_jobs > thresholds.backlog_threshold {
        return QueueHealth::Degraded;
    }

    QueueHealth::Healthy
}

/// Healthy when every queue is healthy, or has neither workers nor pending work.
pub fn overall<'a>(queues: impl IntoIterator<Item = &'a QueueHealthDetails>) -> OverallHealth {
    let all_fine = queues.into_iter().all(|queue| match queue.status {
        QueueHealth::Healthy => true,
        QueueHealth::NoWorkers => queue.pending_jobs == 0,
        QueueHealth::Degraded | QueueHealth::Stalled => false,
    });

    if all_fine {
        OverallHealth::Healthy
    } else {
        OverallHealth::Degraded
    }
}
