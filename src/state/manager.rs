//! The State Manager: sole mutator of job status, metadata, and logs.
//!
//! Status writes are the durability boundary and their errors propagate.
//! Logging, report appends, and event publishing are best-effort: failures
//! are traced and swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::events::{Event, EventBus, JobCreated, StatusChanged};
use crate::jobs::{ChildJobStats, Job, JobStatus, JsonMap, ReportKind};
use crate::store::{CascadeReport, Database, JobFilter, JobLogEntry, LogLevel, StatusWrite};

/// Mediates every job mutation and emits the matching events.
pub struct StateManager {
    store: Arc<dyn Database>,
    bus: Arc<EventBus>,
}

impl StateManager {
    pub fn new(store: Arc<dyn Database>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Persist a new job after checking its hierarchy shape.
    pub async fn create_job(&self, job: &Job) -> Result<()> {
        job.validate_shape()?;
        self.store.create_job(job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, name = %job.name, "Job created");
        self.emit(Event::JobCreated(JobCreated::from_job(job)));
        Ok(())
    }

    pub async fn find_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs(filter).await?)
    }

    pub async fn list_child_jobs(&self, parent_id: Uuid) -> Result<Vec<Job>> {
        Ok(self.store.list_child_jobs(parent_id).await?)
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Move a job to `status`.
    ///
    /// Returns `false` without side effects when the job is already
    /// terminal.
    pub async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<bool> {
        self.write_status(id, status, None).await
    }

    /// Mark a job failed with a reason, surfacing the reason in its report.
    pub async fn fail_job(&self, id: Uuid, reason: &str) -> Result<bool> {
        let applied = self.write_status(id, JobStatus::Failed, Some(reason)).await?;
        if applied {
            self.add_error(id, reason).await;
        }
        Ok(applied)
    }

    /// Mark a job failed with a summary reason, leaving the report alone.
    ///
    /// For callers that already reported each underlying error.
    pub async fn fail_job_summary(&self, id: Uuid, reason: &str) -> Result<bool> {
        self.write_status(id, JobStatus::Failed, Some(reason)).await
    }

    async fn write_status(&self, id: Uuid, status: JobStatus, error: Option<&str>) -> Result<bool> {
        let job = self.get_job(id).await?;

        if let StatusWrite::Rejected { current } =
            self.store.update_job_status(id, status, error).await?
        {
            debug!(job_id = %id, current = %current, requested = %status, "Status unchanged, job already terminal");
            return Ok(false);
        }

        let mut message = format!("Status changed: {status} [{}: {}]", job.job_type, job.name);
        if let Some(error) = error {
            message.push_str(&format!(" - {error}"));
        }
        // Children log at debug to keep parent streams readable.
        let level = if job.is_root() {
            info!(job_id = %id, status = %status, "{message}");
            LogLevel::Info
        } else {
            debug!(job_id = %id, status = %status, "{message}");
            LogLevel::Debug
        };
        self.add_log(id, level, message).await;

        let mut payload = StatusChanged::new(&job, status);
        payload.error = error.map(str::to_string);
        let lifecycle = Event::lifecycle(payload.clone());
        self.emit(Event::StatusChanged(payload));
        if let Some(lifecycle) = lifecycle {
            self.emit(lifecycle);
        }
        Ok(true)
    }

    /// Stamp `finished_at`. Idempotent: later calls keep the first stamp.
    ///
    /// Monitors call this only after resolving a terminal status from
    /// fully-settled children.
    pub async fn set_finished(&self, id: Uuid) -> Result<bool> {
        let job = self.get_job(id).await?;
        if !job.status.is_terminal() {
            return Err(JobError::NotTerminal {
                id,
                status: job.status.to_string(),
            }
            .into());
        }
        Ok(self.store.set_finished(id).await?)
    }

    /// Cancel every pending or running direct child.
    ///
    /// Does not wait for workers to acknowledge. Returns how many children
    /// were moved to cancelled.
    pub async fn stop_all_child_jobs(&self, parent_id: Uuid) -> Result<usize> {
        let children = self.store.list_child_jobs(parent_id).await?;
        let mut stopped = 0;
        for child in children.iter().filter(|c| !c.status.is_terminal()) {
            match self.update_status(child.id, JobStatus::Cancelled).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %child.id, error = %e, "Failed to stop child job"),
            }
        }
        if stopped > 0 {
            self.add_log(
                parent_id,
                LogLevel::Warn,
                format!("Stopped {stopped} child jobs"),
            )
            .await;
        }
        info!(parent_id = %parent_id, stopped, "Stopped child jobs");
        Ok(stopped)
    }

    /// Move every running job back to pending.
    pub async fn requeue_running_jobs(&self, reason: &str) -> Result<usize> {
        Ok(self.store.mark_running_jobs_as_pending(reason).await?)
    }

    pub async fn stale_jobs(&self, threshold_minutes: i64) -> Result<Vec<Job>> {
        Ok(self.store.get_stale_jobs(threshold_minutes).await?)
    }

    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        Ok(self.store.touch_heartbeat(id).await?)
    }

    // ── Metadata ────────────────────────────────────────────────────

    /// Merge keys into the job's metadata. Never replaces the whole map.
    pub async fn update_metadata(&self, id: Uuid, patch: JsonMap) -> Result<()> {
        Ok(self.store.update_job_metadata(id, &patch).await?)
    }

    /// Convenience for a single-key merge.
    pub async fn set_metadata(&self, id: Uuid, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut patch = JsonMap::new();
        patch.insert(key.to_string(), value.into());
        self.update_metadata(id, patch).await
    }

    pub async fn increment_document_count(&self, id: Uuid) -> Result<u64> {
        Ok(self.store.increment_document_count(id).await?)
    }

    pub async fn child_stats(&self, parent_id: Uuid) -> Result<ChildJobStats> {
        let mut stats = self.store.get_child_stats(&[parent_id]).await?;
        Ok(stats.remove(&parent_id).unwrap_or_default())
    }

    pub async fn child_stats_many(
        &self,
        parent_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ChildJobStats>> {
        Ok(self.store.get_child_stats(parent_ids).await?)
    }

    // ── Logs ────────────────────────────────────────────────────────

    /// Append to the job's log stream. Best-effort.
    pub async fn add_log(&self, id: Uuid, level: LogLevel, message: impl Into<String>) {
        let entry = JobLogEntry::new(id, level, message);
        if let Err(e) = self.store.append_job_log(&entry).await {
            warn!(job_id = %id, error = %e, "Failed to append job log");
        }
    }

    /// Record an error in the job's status report and log. Best-effort.
    pub async fn add_error(&self, id: Uuid, message: &str) {
        self.report(id, ReportKind::Error, message).await;
        self.add_log(id, LogLevel::Error, message).await;
    }

    /// Record a warning in the job's status report and log. Best-effort.
    pub async fn add_warning(&self, id: Uuid, message: &str) {
        self.report(id, ReportKind::Warning, message).await;
        self.add_log(id, LogLevel::Warn, message).await;
    }

    async fn report(&self, id: Uuid, kind: ReportKind, message: &str) {
        if let Err(e) = self.store.append_status_report(id, kind, message).await {
            warn!(job_id = %id, error = %e, "Failed to update status report");
        }
    }

    pub async fn job_logs(&self, id: Uuid, limit: usize) -> Result<Vec<JobLogEntry>> {
        Ok(self.store.get_job_logs(id, limit).await?)
    }

    // ── Deletion ────────────────────────────────────────────────────

    /// Delete a job tree, children first.
    pub async fn delete_job(&self, id: Uuid) -> Result<CascadeReport> {
        let report = self.store.delete_job_cascade(id).await?;
        if report.is_complete() {
            info!(job_id = %id, deleted = report.deleted, "Deleted job tree");
        } else {
            warn!(
                job_id = %id,
                deleted = report.deleted,
                failed = report.failures.len(),
                "Deleted job tree with failures"
            );
        }
        Ok(report)
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Publish asynchronously. Delivery is best-effort.
    pub fn emit(&self, event: Event) {
        let event_type = event.event_type();
        if let Err(e) = self.bus.publish(event) {
            debug!(event_type = %event_type, error = %e, "Event not published");
        }
    }
}
