//! Backend-agnostic `Database` trait: the storage contract the core consumes.
//!
//! Every mutation a concurrent writer can race on (status, metadata merge,
//! counters, report appends, finish stamp) is a single atomic operation in
//! the backend. Callers never read-modify-write a job record.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{ChildJobStats, Job, JobStatus, JobType, JsonMap, ReportKind};

/// Deepest level a cascade delete descends to.
pub const MAX_CASCADE_DEPTH: usize = 10;

/// Outcome of a compare-and-set status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// The new status was stored.
    Applied,
    /// The job was already terminal; nothing changed.
    Rejected { current: JobStatus },
}

impl StatusWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One line of a job's own log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl JobLogEntry {
    pub fn new(job_id: Uuid, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Filter for `list_jobs`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub parent_id: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.parent_id.is_none_or(|p| job.parent_id == Some(p))
            && self.status.is_none_or(|s| job.status == s)
            && self.job_type.is_none_or(|t| job.job_type == t)
    }
}

/// A single failed deletion inside a cascade.
#[derive(Debug, Clone)]
pub struct CascadeFailure {
    pub job_id: Uuid,
    pub error: String,
}

/// Result of a cascade delete: what went, and what refused to.
#[derive(Debug, Clone, Default)]
pub struct CascadeReport {
    pub deleted: usize,
    pub failures: Vec<CascadeFailure>,
}

impl CascadeReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Aggregate of every individual failure, if any occurred.
    pub fn error(&self) -> Option<DatabaseError> {
        if self.failures.is_empty() {
            return None;
        }
        let detail = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.job_id, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Some(DatabaseError::Query(format!(
            "{} deletion(s) failed: {detail}",
            self.failures.len()
        )))
    }
}

/// Backend-agnostic persistence for jobs, job logs, and settings.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job record.
    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Set a job's status unless it is already terminal.
    ///
    /// `error` is stored when given. Moving to `running` stamps
    /// `started_at` the first time. Unknown IDs yield `NotFound`.
    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<StatusWrite, DatabaseError>;

    /// Merge `patch` into the job's metadata (RFC 7396 semantics).
    async fn update_job_metadata(&self, id: Uuid, patch: &JsonMap) -> Result<(), DatabaseError>;

    /// Append a line to `metadata.status_report.{errors|warnings}`.
    async fn append_status_report(
        &self,
        id: Uuid,
        kind: ReportKind,
        message: &str,
    ) -> Result<(), DatabaseError>;

    /// Atomically add one to `metadata.document_count`, returning the new value.
    async fn increment_document_count(&self, id: Uuid) -> Result<u64, DatabaseError>;

    /// Stamp `finished_at` if unset. Returns whether this call stamped it.
    async fn set_finished(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Record a liveness stamp.
    async fn touch_heartbeat(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Status counts of the direct children of each parent, from one read.
    ///
    /// Parents without children map to zeroed stats.
    async fn get_child_stats(
        &self,
        parent_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ChildJobStats>, DatabaseError>;

    /// Direct children of a parent, oldest first.
    async fn list_child_jobs(&self, parent_id: Uuid) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs matching a filter, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;

    /// Running jobs with no heartbeat for longer than the threshold.
    async fn get_stale_jobs(&self, threshold_minutes: i64) -> Result<Vec<Job>, DatabaseError>;

    /// Move every running job back to pending, logging `reason` on each.
    async fn mark_running_jobs_as_pending(&self, reason: &str) -> Result<usize, DatabaseError>;

    /// Delete a single job record and its log lines.
    async fn delete_job(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Delete a job and all of its descendants, children first.
    ///
    /// A failing deletion is recorded and skipped; siblings and the parent
    /// are still attempted.
    async fn delete_job_cascade(&self, id: Uuid) -> Result<CascadeReport, DatabaseError> {
        if self.get_job(id).await?.is_none() {
            return Err(DatabaseError::job_not_found(id));
        }
        let mut report = CascadeReport::default();
        delete_subtree(self, id, 0, &mut report).await;
        Ok(report)
    }

    // ── Job logs ────────────────────────────────────────────────────

    /// Append a log line to a job's log stream.
    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), DatabaseError>;

    /// Most recent `limit` log lines for a job, in append order.
    async fn get_job_logs(&self, job_id: Uuid, limit: usize)
    -> Result<Vec<JobLogEntry>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    async fn delete_setting(&self, key: &str) -> Result<(), DatabaseError>;

    /// All settings whose key starts with `prefix`, sorted by key.
    async fn list_settings(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError>;
}

fn delete_subtree<'a, D: Database + ?Sized>(
    db: &'a D,
    id: Uuid,
    depth: usize,
    report: &'a mut CascadeReport,
) -> BoxFuture<'a, ()> {
    async move {
        if depth < MAX_CASCADE_DEPTH {
            match db.list_child_jobs(id).await {
                Ok(children) => {
                    for child in children {
                        delete_subtree(db, child.id, depth + 1, report).await;
                    }
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Failed to list children for cascade delete");
                    report.failures.push(CascadeFailure {
                        job_id: id,
                        error: e.to_string(),
                    });
                }
            }
        } else {
            warn!(job_id = %id, depth, "Cascade delete reached maximum depth");
        }

        match db.delete_job(id).await {
            Ok(()) => {
                report.deleted += 1;
                debug!(job_id = %id, depth, "Deleted job");
            }
            Err(e) => {
                warn!(job_id = %id, depth, error = %e, "Failed to delete job, continuing");
                report.failures.push(CascadeFailure {
                    job_id: id,
                    error: e.to_string(),
                });
            }
        }
    }
    .boxed()
}
