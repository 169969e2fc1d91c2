//! Event types and payload schemas.
//!
//! Field names are part of the wire contract consumed by UIs; keep them
//! stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{ChildJobStats, Job, JobStatus, JobType, StatusReport};

/// Discriminant used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobCreated,
    JobStatusChange,
    JobCompleted,
    JobFailed,
    JobCancelled,
    StepProgress,
    ParentJobProgress,
    JobProgress,
    StepCompleted,
    DocumentSaved,
    DocumentUpdated,
    JobError,
    JobWarning,
    CollectionTriggered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "job_created",
            Self::JobStatusChange => "job_status_change",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::StepProgress => "step_progress",
            Self::ParentJobProgress => "parent_job_progress",
            Self::JobProgress => "job_progress",
            Self::StepCompleted => "step_completed",
            Self::DocumentSaved => "document_saved",
            Self::DocumentUpdated => "document_updated",
            Self::JobError => "job_error",
            Self::JobWarning => "job_warning",
            Self::CollectionTriggered => "collection_triggered",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable event: `{"type": ..., "payload": {...}}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    JobCreated(JobCreated),
    #[serde(rename = "job_status_change")]
    StatusChanged(StatusChanged),
    JobCompleted(StatusChanged),
    JobFailed(StatusChanged),
    JobCancelled(StatusChanged),
    StepProgress(StepProgress),
    #[serde(rename = "parent_job_progress")]
    ManagerProgress(ManagerProgress),
    JobProgress(StepLifecycle),
    StepCompleted(StepCompleted),
    DocumentSaved(DocumentEvent),
    DocumentUpdated(DocumentEvent),
    JobError(JobIssue),
    JobWarning(JobIssue),
    CollectionTriggered(CollectionTriggered),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::JobCreated(_) => EventType::JobCreated,
            Self::StatusChanged(_) => EventType::JobStatusChange,
            Self::JobCompleted(_) => EventType::JobCompleted,
            Self::JobFailed(_) => EventType::JobFailed,
            Self::JobCancelled(_) => EventType::JobCancelled,
            Self::StepProgress(_) => EventType::StepProgress,
            Self::ManagerProgress(_) => EventType::ParentJobProgress,
            Self::JobProgress(_) => EventType::JobProgress,
            Self::StepCompleted(_) => EventType::StepCompleted,
            Self::DocumentSaved(_) => EventType::DocumentSaved,
            Self::DocumentUpdated(_) => EventType::DocumentUpdated,
            Self::JobError(_) => EventType::JobError,
            Self::JobWarning(_) => EventType::JobWarning,
            Self::CollectionTriggered(_) => EventType::CollectionTriggered,
        }
    }

    /// The dedicated lifecycle event for a terminal status, if any.
    pub fn lifecycle(payload: StatusChanged) -> Option<Self> {
        match payload.status {
            JobStatus::Completed => Some(Self::JobCompleted(payload)),
            JobStatus::Failed => Some(Self::JobFailed(payload)),
            JobStatus::Cancelled => Some(Self::JobCancelled(payload)),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl JobCreated {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            name: job.name.clone(),
            parent_id: job.parent_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChanged {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusChanged {
    pub fn new(job: &Job, status: JobStatus) -> Self {
        let document_count = job.document_count();
        Self {
            job_id: job.id,
            status,
            job_type: job.job_type,
            parent_id: job.parent_id,
            document_count: (document_count > 0).then_some(document_count),
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub step_id: Uuid,
    pub manager_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub status: JobStatus,
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub progress_text: String,
    pub timestamp: DateTime<Utc>,
}

impl StepProgress {
    pub fn new(
        step_id: Uuid,
        manager_id: Uuid,
        step_name: Option<String>,
        status: JobStatus,
        stats: &ChildJobStats,
    ) -> Self {
        Self {
            step_id,
            manager_id,
            step_name,
            status,
            total_jobs: stats.total,
            pending_jobs: stats.pending,
            running_jobs: stats.running,
            completed_jobs: stats.completed,
            failed_jobs: stats.failed,
            cancelled_jobs: stats.cancelled,
            progress_text: stats.progress_text(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerProgress {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_children: usize,
    pub pending_children: usize,
    pub running_children: usize,
    pub completed_children: usize,
    pub failed_children: usize,
    pub cancelled_children: usize,
    pub progress_text: String,
    pub document_count: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ManagerProgress {
    pub fn new(
        job_id: Uuid,
        status: JobStatus,
        stats: &ChildJobStats,
        document_count: u64,
        report: StatusReport,
    ) -> Self {
        Self {
            job_id,
            status,
            total_children: stats.total,
            pending_children: stats.pending,
            running_children: stats.running,
            completed_children: stats.completed,
            failed_children: stats.failed,
            cancelled_children: stats.cancelled,
            progress_text: stats.progress_text(),
            document_count,
            errors: report.errors,
            warnings: report.warnings,
            timestamp: Utc::now(),
        }
    }
}

/// A step being dispatched by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLifecycle {
    pub manager_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompleted {
    pub step_id: Uuid,
    pub manager_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub status: JobStatus,
    pub total_jobs: usize,
    pub failed_jobs: usize,
    pub timestamp: DateTime<Utc>,
}

/// Payload of both `document_saved` and `document_updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub job_id: Uuid,
    pub parent_job_id: Uuid,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DocumentEvent {
    pub fn new(job_id: Uuid, parent_job_id: Uuid, document_id: impl Into<String>) -> Self {
        Self {
            job_id,
            parent_job_id,
            document_id: document_id.into(),
            source_url: None,
            timestamp: Utc::now(),
        }
    }
}

/// Payload of `job_error` and `job_warning`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIssue {
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<Uuid>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl JobIssue {
    pub fn new(job_id: Uuid, parent_job_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self {
            job_id,
            parent_job_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionTriggered {
    pub triggered_by: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_changed_wire_shape() {
        let job = Job::manager("m");
        let event = Event::StatusChanged(StatusChanged::new(&job, JobStatus::Running));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("job_status_change"));
        assert_eq!(value["payload"]["status"], json!("running"));
        assert_eq!(value["payload"]["job_type"], json!("manager"));
        assert!(value["payload"].get("parent_id").is_none());
        assert!(value["payload"].get("document_count").is_none());
    }

    #[test]
    fn manager_progress_wire_shape() {
        let stats = ChildJobStats::from_statuses([JobStatus::Completed, JobStatus::Running]);
        let event = Event::ManagerProgress(ManagerProgress::new(
            Uuid::nil(),
            JobStatus::Running,
            &stats,
            4,
            StatusReport::default(),
        ));
        assert_eq!(event.event_type(), EventType::ParentJobProgress);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("parent_job_progress"));
        for field in [
            "total_children",
            "pending_children",
            "running_children",
            "completed_children",
            "failed_children",
            "cancelled_children",
            "progress_text",
            "document_count",
            "errors",
            "warnings",
            "timestamp",
        ] {
            assert!(value["payload"].get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn step_progress_carries_both_ids() {
        let stats = ChildJobStats::from_statuses([JobStatus::Failed]);
        let step_id = Uuid::new_v4();
        let manager_id = Uuid::new_v4();
        let payload =
            StepProgress::new(step_id, manager_id, Some("fetch".into()), JobStatus::Failed, &stats);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["step_id"], json!(step_id.to_string()));
        assert_eq!(value["manager_id"], json!(manager_id.to_string()));
        assert_eq!(value["failed_jobs"], json!(1));
    }

    #[test]
    fn lifecycle_only_for_terminal() {
        let job = Job::manager("m");
        assert!(Event::lifecycle(StatusChanged::new(&job, JobStatus::Running)).is_none());
        let event = Event::lifecycle(StatusChanged::new(&job, JobStatus::Cancelled)).unwrap();
        assert_eq!(event.event_type(), EventType::JobCancelled);
    }

    #[test]
    fn event_type_string_matches_wire_tag() {
        let event = Event::DocumentSaved(DocumentEvent::new(Uuid::nil(), Uuid::nil(), "doc-1"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!(event.event_type().as_str()));
    }
}
