//! In-process `Database` backend.
//!
//! All state lives behind one `RwLock`, so every mutation is atomic with
//! respect to every other. Used by tests and single-process deployments
//! that do not need durability.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{ChildJobStats, Job, JobStatus, JsonMap, ReportKind, keys, merge_patch};
use crate::store::traits::{Database, JobFilter, JobLogEntry, LogLevel, StatusWrite};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    logs: HashMap<Uuid, Vec<JobLogEntry>>,
    settings: BTreeMap<String, String>,
}

impl MemoryState {
    fn job_mut(&mut self, id: Uuid) -> Result<&mut Job, DatabaseError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::job_not_found(id))
    }
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryStore {
    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(DatabaseError::Constraint(format!(
                "job {} already exists",
                job.id
            )));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<StatusWrite, DatabaseError> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.status.is_terminal() {
            return Ok(StatusWrite::Rejected {
                current: job.status,
            });
        }
        job.status = status;
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        if status == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        Ok(StatusWrite::Applied)
    }

    async fn update_job_metadata(&self, id: Uuid, patch: &JsonMap) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        merge_patch(&mut state.job_mut(id)?.metadata, patch);
        Ok(())
    }

    async fn append_status_report(
        &self,
        id: Uuid,
        kind: ReportKind,
        message: &str,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        let metadata = &mut state.job_mut(id)?.metadata;
        let report = metadata
            .entry(keys::STATUS_REPORT)
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !report.is_object() {
            *report = Value::Object(JsonMap::new());
        }
        if let Value::Object(report) = report {
            let list = report
                .entry(kind.field())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !list.is_array() {
                *list = Value::Array(Vec::new());
            }
            if let Value::Array(list) = list {
                list.push(Value::String(message.to_string()));
            }
        }
        Ok(())
    }

    async fn increment_document_count(&self, id: Uuid) -> Result<u64, DatabaseError> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        let next = job.document_count() + 1;
        job.metadata
            .insert(keys::DOCUMENT_COUNT.into(), Value::from(next));
        Ok(next)
    }

    async fn set_finished(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.finished_at.is_some() {
            return Ok(false);
        }
        job.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn touch_heartbeat(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        state.job_mut(id)?.last_heartbeat = Some(Utc::now());
        Ok(())
    }

    async fn get_child_stats(
        &self,
        parent_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ChildJobStats>, DatabaseError> {
        let state = self.state.read().await;
        let mut stats: HashMap<Uuid, ChildJobStats> = parent_ids
            .iter()
            .map(|id| (*id, ChildJobStats::default()))
            .collect();
        for job in state.jobs.values() {
            if let Some(entry) = job.parent_id.and_then(|p| stats.get_mut(&p)) {
                entry.record(job.status);
            }
        }
        Ok(stats)
    }

    async fn list_child_jobs(&self, parent_id: Uuid) -> Result<Vec<Job>, DatabaseError> {
        let state = self.state.read().await;
        let mut children: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|j| j.created_at);
        Ok(children)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn get_stale_jobs(&self, threshold_minutes: i64) -> Result<Vec<Job>, DatabaseError> {
        let cutoff = Utc::now() - Duration::minutes(threshold_minutes);
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| {
                let last_seen = j.last_heartbeat.or(j.started_at).unwrap_or(j.created_at);
                last_seen < cutoff
            })
            .cloned()
            .collect())
    }

    async fn mark_running_jobs_as_pending(&self, reason: &str) -> Result<usize, DatabaseError> {
        let mut state = self.state.write().await;
        let mut requeued = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                requeued.push(job.id);
            }
        }
        for id in &requeued {
            state
                .logs
                .entry(*id)
                .or_default()
                .push(JobLogEntry::new(*id, LogLevel::Warn, reason));
        }
        Ok(requeued.len())
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        if state.jobs.remove(&id).is_none() {
            return Err(DatabaseError::job_not_found(id));
        }
        state.logs.remove(&id);
        Ok(())
    }

    // ── Job logs ────────────────────────────────────────────────────

    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        state
            .logs
            .entry(entry.job_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn get_job_logs(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<JobLogEntry>, DatabaseError> {
        let state = self.state.read().await;
        let logs = state.logs.get(&job_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = logs.len().saturating_sub(limit);
        Ok(logs[start..].to_vec())
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.state.read().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<(), DatabaseError> {
        self.state.write().await.settings.remove(key);
        Ok(())
    }

    async fn list_settings(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .settings
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
