//! Job records, statuses, and derived child statistics.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

/// Opaque key/value map used for job config and metadata.
pub type JsonMap = serde_json::Map<String, Value>;

/// Well-known metadata keys.
pub mod keys {
    pub const STEP_NAME: &str = "step_name";
    pub const STEP_ID: &str = "step_id";
    pub const STEP_INDEX: &str = "step_index";
    pub const STEP_TYPE: &str = "step_type";
    pub const STEP_STATUSES: &str = "step_statuses";
    pub const MANAGER_ID: &str = "manager_id";
    pub const STATUS_REPORT: &str = "status_report";
    pub const DOCUMENT_COUNT: &str = "document_count";
    pub const CURRENT_STEP: &str = "current_step";
    pub const CURRENT_STEP_NAME: &str = "current_step_name";
    pub const TOTAL_STEPS: &str = "total_steps";
    pub const JOB_DEF_ID: &str = "job_def_id";
    pub const JOB_DEF_NAME: &str = "job_def_name";
    pub const SEQUENCE: &str = "sequence";
    pub const ERROR_TOLERANCE: &str = "error_tolerance";
    pub const WORK_ITEM_ID: &str = "work_item_id";
    pub const ITEM_TYPE: &str = "item_type";
}

/// Level in the Manager → Step → Worker hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Manager,
    Step,
    Worker,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Step => "step",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manager" => Ok(Self::Manager),
            "step" => Ok(Self::Step),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Status of a job.
///
/// Status only moves forward: once terminal it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet picked up.
    Pending,
    /// Being worked on.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before finishing.
    Cancelled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] = [Self::Completed, Self::Failed, Self::Cancelled];

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record at any level of the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    /// Direct parent. `None` only for managers.
    pub parent_id: Option<Uuid>,
    /// Root manager of the tree. `None` on the manager itself.
    pub manager_id: Option<Uuid>,
    pub name: String,
    pub config: JsonMap,
    pub metadata: JsonMap,
    pub status: JobStatus,
    pub error: Option<String>,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Job {
    fn with_type(job_type: JobType, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            parent_id: None,
            manager_id: None,
            name: name.into(),
            config: JsonMap::new(),
            metadata: JsonMap::new(),
            status: JobStatus::Pending,
            error: None,
            depth: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_heartbeat: None,
        }
    }

    /// A new root manager job.
    pub fn manager(name: impl Into<String>) -> Self {
        Self::with_type(JobType::Manager, name)
    }

    /// A new step owned by `manager`.
    pub fn step(manager: &Job, name: impl Into<String>) -> Self {
        let mut job = Self::with_type(JobType::Step, name);
        job.parent_id = Some(manager.id);
        job.manager_id = Some(manager.root_id());
        job.depth = manager.depth + 1;
        job.metadata
            .insert(keys::MANAGER_ID.into(), Value::String(manager.root_id().to_string()));
        job
    }

    /// A new worker job owned by `step`.
    pub fn worker(step: &Job, name: impl Into<String>) -> Self {
        let mut job = Self::with_type(JobType::Worker, name);
        job.parent_id = Some(step.id);
        job.manager_id = Some(step.root_id());
        job.depth = step.depth + 1;
        job.metadata
            .insert(keys::STEP_ID.into(), Value::String(step.id.to_string()));
        job.metadata
            .insert(keys::MANAGER_ID.into(), Value::String(step.root_id().to_string()));
        job
    }

    pub fn with_config(mut self, config: JsonMap) -> Self {
        self.config = config;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// The manager at the root of this job's tree.
    pub fn root_id(&self) -> Uuid {
        self.manager_id.unwrap_or(self.id)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Check the structural invariants of the hierarchy.
    pub fn validate_shape(&self) -> Result<(), ValidationError> {
        let reason = match (self.job_type, self.parent_id) {
            (JobType::Manager, Some(_)) => Some("manager jobs must not have a parent"),
            (JobType::Step | JobType::Worker, None) => Some("non-manager jobs require a parent"),
            (_, Some(parent)) if parent == self.id => Some("job cannot be its own parent"),
            _ => None,
        };
        match reason {
            Some(reason) => Err(ValidationError::JobShape {
                id: self.id,
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Read a UUID stored under a metadata key.
    pub fn metadata_uuid(&self, key: &str) -> Option<Uuid> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn document_count(&self) -> u64 {
        self.metadata
            .get(keys::DOCUMENT_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn status_report(&self) -> StatusReport {
        self.metadata
            .get(keys::STATUS_REPORT)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Errors and warnings surfaced to the UI through job metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Which list of the status report to append to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Error,
    Warning,
}

impl ReportKind {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Error => "errors",
            Self::Warning => "warnings",
        }
    }
}

/// Status counts for the direct children of one parent.
///
/// Always derived from a live read; never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildJobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ChildJobStats {
    pub fn from_statuses<I: IntoIterator<Item = JobStatus>>(statuses: I) -> Self {
        let mut stats = Self::default();
        for status in statuses {
            stats.record(status);
        }
        stats
    }

    pub fn record(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// At least one child exists and every child is terminal.
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.terminal() == self.total
    }

    /// The per-status counts add up to the total.
    pub fn is_consistent(&self) -> bool {
        self.pending + self.running + self.terminal() == self.total
    }

    /// Aggregate status while children are still in flight.
    pub fn overall_status(&self) -> JobStatus {
        if self.total == 0 || self.running > 0 || self.pending > 0 {
            JobStatus::Running
        } else if self.failed > 0 {
            JobStatus::Failed
        } else if self.cancelled == self.total {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        }
    }

    pub fn progress_text(&self) -> String {
        format!(
            "{} pending, {} running, {} completed, {} failed",
            self.pending, self.running, self.completed, self.failed
        )
    }
}

/// Apply an RFC 7396 merge patch: objects merge key by key, `null` removes.
pub fn merge_patch(target: &mut JsonMap, patch: &JsonMap) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(inner) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(JsonMap::new()));
                if !entry.is_object() {
                    *entry = Value::Object(JsonMap::new());
                }
                if let Value::Object(existing) = entry {
                    merge_patch(existing, inner);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        for status in JobStatus::TERMINAL {
            assert!(status.is_terminal());
        }
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_round_trips_through_wire_string() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                json!(status.as_str())
            );
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn hierarchy_constructors_link_to_root() {
        let manager = Job::manager("crawl");
        let step = Job::step(&manager, "fetch");
        let worker = Job::worker(&step, "url-1");

        assert_eq!(step.parent_id, Some(manager.id));
        assert_eq!(worker.parent_id, Some(step.id));
        assert_eq!(worker.root_id(), manager.id);
        assert_eq!(worker.depth, 2);
        assert_eq!(worker.metadata_uuid(keys::STEP_ID), Some(step.id));
        assert!(manager.validate_shape().is_ok());
        assert!(worker.validate_shape().is_ok());
    }

    #[test]
    fn orphan_step_fails_validation() {
        let mut step = Job::step(&Job::manager("m"), "s");
        step.parent_id = None;
        assert!(step.validate_shape().is_err());
    }

    #[test]
    fn stats_count_and_settle() {
        let stats = ChildJobStats::from_statuses([
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Running,
        ]);
        assert_eq!(stats.total, 3);
        assert!(stats.is_consistent());
        assert!(!stats.is_settled());
        assert_eq!(stats.overall_status(), JobStatus::Running);
        assert_eq!(
            stats.progress_text(),
            "0 pending, 1 running, 1 completed, 1 failed"
        );

        let empty = ChildJobStats::default();
        assert!(!empty.is_settled());
        assert_eq!(empty.overall_status(), JobStatus::Running);
    }

    #[test]
    fn overall_status_after_settling() {
        let cancelled = ChildJobStats::from_statuses([JobStatus::Cancelled; 2]);
        assert_eq!(cancelled.overall_status(), JobStatus::Cancelled);
        let mixed = ChildJobStats::from_statuses([JobStatus::Completed, JobStatus::Cancelled]);
        assert_eq!(mixed.overall_status(), JobStatus::Completed);
    }

    #[test]
    fn merge_patch_merges_nested_and_removes_null() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}, "gone": true})
            .as_object()
            .cloned()
            .unwrap();
        let patch = json!({"b": 2, "nested": {"y": 3}, "gone": null})
            .as_object()
            .cloned()
            .unwrap();
        merge_patch(&mut target, &patch);
        assert_eq!(
            Value::Object(target),
            json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}})
        );
    }

    #[test]
    fn status_report_defaults_when_absent() {
        let job = Job::manager("m");
        assert_eq!(job.status_report(), StatusReport::default());
        let job = job.with_metadata(
            keys::STATUS_REPORT,
            json!({"errors": ["boom"]}),
        );
        assert_eq!(job.status_report().errors, vec!["boom".to_string()]);
    }
}
