//! Step monitor: resolves one step from its worker jobs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::{Result, ValidationError};
use crate::events::{Event, StepCompleted, StepProgress};
use crate::jobs::{ChildJobStats, ErrorTolerance, Job, JobStatus, JobType, JsonMap, keys};
use crate::monitor::watch::{WatchScope, spawn_watch};
use crate::monitor::{FailurePolicy, WatchRegistry};
use crate::state::StateManager;

/// Starts one watch per step that spawns worker jobs.
pub struct StepMonitor {
    state: Arc<StateManager>,
    config: MonitorConfig,
    registry: Arc<WatchRegistry>,
}

impl StepMonitor {
    pub fn new(
        state: Arc<StateManager>,
        config: MonitorConfig,
        registry: Arc<WatchRegistry>,
    ) -> Self {
        Self {
            state,
            config,
            registry,
        }
    }

    /// Watch `step` until its workers settle.
    ///
    /// `tolerance` caps how many failed workers are accepted before its
    /// failure action runs.
    pub async fn start_monitoring(
        &self,
        step: &Job,
        tolerance: Option<ErrorTolerance>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        step.validate_shape()?;
        if step.job_type != JobType::Step {
            return Err(ValidationError::JobShape {
                id: step.id,
                reason: format!("step monitor cannot watch a {} job", step.job_type),
            }
            .into());
        }

        let mut step = self.state.get_job(step.id).await?;
        if step.status == JobStatus::Pending {
            self.state.update_status(step.id, JobStatus::Running).await?;
            step.status = JobStatus::Running;
        }

        let scope = StepScope {
            manager_id: step_manager_id(&step),
            policy: self.config.step_failure_policy,
            tolerance,
            registry: Arc::clone(&self.registry),
        };
        Ok(spawn_watch(
            Arc::clone(&self.state),
            self.config.clone(),
            Arc::clone(&self.registry),
            step,
            scope,
            cancel,
        ))
    }
}

/// Owning manager: metadata first, then the parent link.
pub(crate) fn step_manager_id(step: &Job) -> Option<Uuid> {
    step.metadata_uuid(keys::MANAGER_ID).or(step.parent_id)
}

pub(crate) fn step_name(step: &Job) -> String {
    step.metadata_str(keys::STEP_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| step.name.clone())
}

/// Publish a StepProgress snapshot for `step`.
pub(crate) fn publish_step_progress(
    state: &StateManager,
    step: &Job,
    status: JobStatus,
    stats: &ChildJobStats,
) {
    let Some(manager_id) = step_manager_id(step) else {
        warn!(step_id = %step.id, "Step has no manager, progress not published");
        return;
    };
    state.emit(Event::StepProgress(StepProgress::new(
        step.id,
        manager_id,
        Some(step_name(step)),
        status,
        stats,
    )));
}

struct StepScope {
    manager_id: Option<Uuid>,
    policy: FailurePolicy,
    tolerance: Option<ErrorTolerance>,
    registry: Arc<WatchRegistry>,
}

#[async_trait]
impl WatchScope for StepScope {
    fn component(&self) -> &'static str {
        "step_monitor"
    }

    fn policy(&self) -> FailurePolicy {
        self.policy
    }

    fn tolerance(&self) -> Option<ErrorTolerance> {
        self.tolerance
    }

    async fn publish_progress(
        &self,
        state: &StateManager,
        job: &Job,
        status: JobStatus,
        stats: &ChildJobStats,
    ) {
        publish_step_progress(state, job, status, stats);
    }

    async fn on_resolved(
        &self,
        state: &StateManager,
        job: &Job,
        status: JobStatus,
        stats: &ChildJobStats,
    ) {
        info!(
            step_id = %job.id,
            status = %status,
            total = stats.total,
            failed = stats.failed,
            "Step resolved"
        );
        let Some(manager_id) = self.manager_id else {
            return;
        };

        let mut statuses = JsonMap::new();
        statuses.insert(job.id.to_string(), Value::from(status.as_str()));
        let mut patch = JsonMap::new();
        patch.insert(keys::STEP_STATUSES.to_string(), Value::Object(statuses));
        if let Err(e) = state.update_metadata(manager_id, patch).await {
            warn!(manager_id = %manager_id, error = %e, "Failed to record step status");
        }

        state.emit(Event::StepCompleted(StepCompleted {
            step_id: job.id,
            manager_id,
            step_name: Some(step_name(job)),
            status,
            total_jobs: stats.total,
            failed_jobs: stats.failed,
            timestamp: Utc::now(),
        }));
        self.registry.nudge(manager_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryStore;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(5),
            no_children_grace: Duration::from_millis(50),
            ..MonitorConfig::default()
        }
    }

    async fn setup(workers: usize) -> (Arc<StateManager>, StepMonitor, Job, Job, Vec<Job>) {
        let state = Arc::new(StateManager::new(
            Arc::new(MemoryStore::new()),
            EventBus::new(),
        ));
        let manager = Job::manager("m");
        let step = Job::step(&manager, "fetch").with_metadata(keys::STEP_NAME, "fetch");
        state.create_job(&manager).await.unwrap();
        state.create_job(&step).await.unwrap();
        let mut jobs = Vec::new();
        for i in 0..workers {
            let worker = Job::worker(&step, format!("w{i}"));
            state.create_job(&worker).await.unwrap();
            jobs.push(worker);
        }
        let monitor = StepMonitor::new(Arc::clone(&state), fast_config(), WatchRegistry::new());
        (state, monitor, manager, step, jobs)
    }

    #[tokio::test]
    async fn rejects_non_step_jobs() {
        let (_, monitor, manager, _, _) = setup(0).await;
        let err = monitor
            .start_monitoring(&manager, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("step monitor cannot watch"));
    }

    #[tokio::test]
    async fn records_step_status_on_manager() {
        let (state, monitor, manager, step, workers) = setup(2).await;
        for worker in &workers {
            state.update_status(worker.id, JobStatus::Completed).await.unwrap();
        }
        let handle = monitor
            .start_monitoring(&step, None, CancellationToken::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let step = state.get_job(step.id).await.unwrap();
        assert_eq!(step.status, JobStatus::Completed);
        assert!(step.finished_at.is_some());
        let manager = state.get_job(manager.id).await.unwrap();
        assert_eq!(
            manager.metadata[keys::STEP_STATUSES][step.id.to_string()],
            json!("completed")
        );
    }

    #[tokio::test]
    async fn stop_all_tolerance_fails_step_and_cancels_workers() {
        let (state, monitor, _, step, workers) = setup(10).await;
        for worker in &workers[..2] {
            state.fail_job(worker.id, "boom").await.unwrap();
        }
        let tolerance = ErrorTolerance {
            max_child_failures: 2,
            failure_action: crate::jobs::FailureAction::StopAll,
        };
        let handle = monitor
            .start_monitoring(&step, Some(tolerance), CancellationToken::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let stats = state.child_stats(step.id).await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.cancelled, 8);
        // Two failures out of ten would pass "all failed"; the tolerance wins.
        let step = state.get_job(step.id).await.unwrap();
        assert_eq!(step.status, JobStatus::Failed);
        assert!(step.finished_at.is_some());
        let error = step.error.clone().unwrap();
        assert!(error.contains("exceeded failure tolerance"), "{error}");
        assert_eq!(step.status_report().errors, vec![error]);
    }

    #[tokio::test]
    async fn mark_warning_tolerance_lets_policy_decide() {
        let (state, monitor, _, step, workers) = setup(3).await;
        state.fail_job(workers[0].id, "boom").await.unwrap();
        for worker in &workers[1..] {
            state.update_status(worker.id, JobStatus::Completed).await.unwrap();
        }
        let tolerance = ErrorTolerance {
            max_child_failures: 1,
            failure_action: crate::jobs::FailureAction::MarkWarning,
        };
        let handle = monitor
            .start_monitoring(&step, Some(tolerance), CancellationToken::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let step = state.get_job(step.id).await.unwrap();
        assert_eq!(step.status, JobStatus::Completed);
        assert_eq!(step.status_report().warnings.len(), 1);
    }
}
