//! Runs a job definition: manager job, then each step in order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::placeholders::resolve_placeholders;
use crate::dispatch::registry::WorkerRegistry;
use crate::dispatch::worker::{DispatchContext, Worker};
use crate::error::{JobError, Result, WorkerError};
use crate::events::{Event, StepCompleted, StepLifecycle};
use crate::jobs::{
    ChildJobStats, ErrorStrategy, Job, JobDefinition, JobStatus, JobStep, JsonMap, keys,
};
use crate::monitor::{JobMonitor, StepMonitor};
use crate::state::StateManager;
use crate::store::LogLevel;

/// How a dispatched step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    /// A step monitor now owns the step.
    Monitored,
    /// The step finished inside dispatch.
    Completed,
}

/// Drives definitions through Validate → Init → CreateJobs per step.
pub struct Orchestrator {
    state: Arc<StateManager>,
    workers: Arc<WorkerRegistry>,
    job_monitor: Arc<JobMonitor>,
    step_monitor: Arc<StepMonitor>,
    config: DispatchConfig,
}

impl Orchestrator {
    pub fn new(
        state: Arc<StateManager>,
        workers: Arc<WorkerRegistry>,
        job_monitor: Arc<JobMonitor>,
        step_monitor: Arc<StepMonitor>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            state,
            workers,
            job_monitor,
            step_monitor,
            config,
        }
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Start a manager job for `definition` and dispatch its steps.
    ///
    /// Returns once every step is dispatched; monitors finish the job in the
    /// background. Nothing is created when the definition or any step
    /// config is invalid.
    pub async fn execute_job_definition(
        &self,
        definition: &JobDefinition,
        cancel: CancellationToken,
    ) -> Result<Uuid> {
        definition.validate()?;
        let mut workers = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            let worker = self.workers.resolve(&step.step_type).await?;
            worker.validate_config(step)?;
            workers.push(worker);
        }

        let manager = Job::manager(definition.name.as_str())
            .with_metadata(keys::JOB_DEF_ID, definition.id.as_str())
            .with_metadata(keys::JOB_DEF_NAME, definition.name.as_str())
            .with_metadata(keys::TOTAL_STEPS, definition.steps.len())
            .with_metadata(keys::CURRENT_STEP, 0);
        self.state.create_job(&manager).await?;
        self.state.update_status(manager.id, JobStatus::Running).await?;
        info!(
            job_id = %manager.id,
            definition = %definition.id,
            steps = definition.steps.len(),
            "Executing job definition"
        );

        let ctx = DispatchContext {
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
            manager_id: manager.id,
        };
        let mut monitored = false;
        let mut failed_steps = 0;

        for (index, (step, worker)) in definition.steps.iter().zip(&workers).enumerate() {
            if cancel.is_cancelled() {
                self.state.update_status(manager.id, JobStatus::Cancelled).await?;
                self.finish(manager.id).await;
                return Err(JobError::Cancelled { id: manager.id }.into());
            }

            let mut progress = JsonMap::new();
            progress.insert(keys::CURRENT_STEP.into(), Value::from(index + 1));
            progress.insert(keys::CURRENT_STEP_NAME.into(), Value::from(step.name.as_str()));
            if let Err(e) = self.state.update_metadata(manager.id, progress).await {
                warn!(job_id = %manager.id, error = %e, "Failed to record current step");
            }

            match self
                .dispatch_step(&ctx, &manager, definition, index, step, worker.as_ref())
                .await
            {
                Ok(StepOutcome::Monitored) => monitored = true,
                Ok(StepOutcome::Completed) => {}
                Err(e) => {
                    let message = JobError::StepFailed {
                        step: step.name.clone(),
                        reason: e.to_string(),
                    }
                    .to_string();
                    if step.on_error == ErrorStrategy::Continue {
                        warn!(job_id = %manager.id, step = %step.name, error = %e, "Step failed, continuing");
                        self.state.add_error(manager.id, &message).await;
                        failed_steps += 1;
                        continue;
                    }
                    self.state.fail_job(manager.id, &message).await?;
                    self.finish(manager.id).await;
                    return Err(JobError::StepFailed {
                        step: step.name.clone(),
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }

        if monitored {
            self.job_monitor.start_monitoring(&manager, cancel).await?;
        } else if failed_steps > 0 {
            // Each step error is already in the report.
            self.state
                .fail_job_summary(manager.id, &format!("{failed_steps} step(s) failed"))
                .await?;
            self.finish(manager.id).await;
        } else {
            self.state.update_status(manager.id, JobStatus::Completed).await?;
            self.finish(manager.id).await;
        }
        Ok(manager.id)
    }

    /// Cancel a job and every active direct child.
    pub async fn cancel_job(&self, id: Uuid) -> Result<usize> {
        self.state.update_status(id, JobStatus::Cancelled).await?;
        let stopped = self.state.stop_all_child_jobs(id).await?;
        self.finish(id).await;
        Ok(stopped)
    }

    /// Create the step job and run it, retrying if the step asks for it.
    async fn dispatch_step(
        &self,
        ctx: &DispatchContext,
        manager: &Job,
        definition: &JobDefinition,
        index: usize,
        step: &JobStep,
        worker: &dyn Worker,
    ) -> Result<StepOutcome> {
        let mut step_job = Job::step(manager, step.name.as_str())
            .with_config(step.config.clone())
            .with_metadata(keys::STEP_INDEX, index)
            .with_metadata(keys::STEP_NAME, step.name.as_str())
            .with_metadata(keys::STEP_TYPE, step.step_type.as_str());
        if let Some(tolerance) = step.error_tolerance
            && let Ok(value) = serde_json::to_value(tolerance)
        {
            step_job = step_job.with_metadata(keys::ERROR_TOLERANCE, value);
        }
        self.state.create_job(&step_job).await?;
        self.state.update_status(step_job.id, JobStatus::Running).await?;
        self.emit_lifecycle(manager, definition, index, &step_job, JobStatus::Running);

        let attempts = match step.on_error {
            ErrorStrategy::Retry => self.config.retry_attempts + 1,
            ErrorStrategy::Continue | ErrorStrategy::Fail => 1,
        };

        let mut attempt = 1;
        let result = loop {
            match self.run_step(ctx, definition, step, worker, &step_job).await {
                Ok(outcome) => break Ok(outcome),
                Err(e) if attempt < attempts && !ctx.cancel.is_cancelled() => {
                    let delay = self.backoff(attempt);
                    warn!(
                        step_id = %step_job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    self.state
                        .add_log(
                            step_job.id,
                            LogLevel::Warn,
                            format!("Attempt {attempt} failed: {e}"),
                        )
                        .await;
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        match &result {
            Ok(StepOutcome::Completed) => {
                self.state.update_status(step_job.id, JobStatus::Completed).await?;
                self.finish(step_job.id).await;
                self.record_step(manager.id, &step_job, JobStatus::Completed).await;
                self.emit_lifecycle(manager, definition, index, &step_job, JobStatus::Completed);
            }
            Ok(StepOutcome::Monitored) => {}
            Err(e) => {
                self.state.fail_job(step_job.id, &e.to_string()).await?;
                self.finish(step_job.id).await;
                self.record_step(manager.id, &step_job, JobStatus::Failed).await;
                self.emit_lifecycle(manager, definition, index, &step_job, JobStatus::Failed);
            }
        }
        result
    }

    /// One attempt: placeholders, Init, CreateJobs, then hand off.
    async fn run_step(
        &self,
        ctx: &DispatchContext,
        definition: &JobDefinition,
        step: &JobStep,
        worker: &dyn Worker,
        step_job: &Job,
    ) -> Result<StepOutcome> {
        let (config, missing) = resolve_placeholders(self.state.store().as_ref(), &step.config).await?;
        if !missing.is_empty() {
            let message = format!("Unresolved placeholders: {}", missing.join(", "));
            self.state.add_warning(step_job.id, &message).await;
        }
        let mut resolved = step.clone();
        resolved.config = config;

        let init = worker
            .init(&ctx.cancel, &resolved, definition)
            .await
            .map_err(|e| WorkerError::Init {
                step_type: step.step_type.to_string(),
                reason: e.to_string(),
            })?;
        let message = format!(
            "Worker initialized: {} work items, strategy={}",
            init.total_count, init.strategy
        );
        info!(step_id = %step_job.id, "{message}");
        self.state.add_log(step_job.id, LogLevel::Info, message).await;

        worker
            .create_jobs(ctx, &resolved, definition, step_job.id, Some(init))
            .await
            .map_err(|e| WorkerError::CreateJobs {
                step_type: step.step_type.to_string(),
                reason: e.to_string(),
            })?;

        if worker.returns_child_jobs() {
            self.step_monitor
                .start_monitoring(step_job, step.error_tolerance, ctx.cancel.child_token())
                .await?;
            Ok(StepOutcome::Monitored)
        } else {
            debug!(step_id = %step_job.id, "Step has no child jobs, completing");
            Ok(StepOutcome::Completed)
        }
    }

    /// Exponential backoff with up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    /// Mirror a step resolved inside dispatch onto the manager.
    async fn record_step(&self, manager_id: Uuid, step_job: &Job, status: JobStatus) {
        let mut statuses = JsonMap::new();
        statuses.insert(step_job.id.to_string(), Value::from(status.as_str()));
        let mut patch = JsonMap::new();
        patch.insert(keys::STEP_STATUSES.into(), Value::Object(statuses));
        if let Err(e) = self.state.update_metadata(manager_id, patch).await {
            warn!(job_id = %manager_id, error = %e, "Failed to record step status");
        }

        let stats = self.state.child_stats(step_job.id).await.unwrap_or_else(|e| {
            debug!(step_id = %step_job.id, error = %e, "No child stats for step");
            ChildJobStats::default()
        });
        self.state.emit(Event::StepCompleted(StepCompleted {
            step_id: step_job.id,
            manager_id,
            step_name: Some(step_job.name.clone()),
            status,
            total_jobs: stats.total,
            failed_jobs: stats.failed,
            timestamp: Utc::now(),
        }));
    }

    fn emit_lifecycle(
        &self,
        manager: &Job,
        definition: &JobDefinition,
        index: usize,
        step_job: &Job,
        status: JobStatus,
    ) {
        self.state.emit(Event::JobProgress(StepLifecycle {
            manager_id: manager.id,
            step_id: step_job.id,
            step_name: step_job.name.clone(),
            step_index: index,
            total_steps: definition.steps.len(),
            status,
            timestamp: Utc::now(),
        }));
    }

    async fn finish(&self, id: Uuid) {
        if let Err(e) = self.state.set_finished(id).await {
            debug!(job_id = %id, error = %e, "Could not stamp finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::events::EventBus;
    use crate::monitor::WatchRegistry;
    use crate::store::MemoryStore;

    fn orchestrator(config: DispatchConfig) -> Orchestrator {
        let state = Arc::new(StateManager::new(
            Arc::new(MemoryStore::new()),
            EventBus::new(),
        ));
        let registry = WatchRegistry::new();
        let monitor_config = MonitorConfig::default();
        Orchestrator::new(
            Arc::clone(&state),
            Arc::new(WorkerRegistry::new()),
            Arc::new(JobMonitor::new(
                Arc::clone(&state),
                monitor_config.clone(),
                Arc::clone(&registry),
            )),
            Arc::new(StepMonitor::new(state, monitor_config, registry)),
            config,
        )
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let orch = orchestrator(DispatchConfig {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        });
        for (attempt, base) in [(1, 100u64), (2, 200), (3, 400)] {
            let delay = orch.backoff(attempt).as_millis() as u64;
            assert!(delay >= base && delay <= base + base / 4, "attempt {attempt}: {delay}");
        }
    }

    #[tokio::test]
    async fn unknown_step_type_creates_nothing() {
        let orch = orchestrator(DispatchConfig::default());
        let definition = JobDefinition::new("d", "D", vec![JobStep::new("s", "missing")]);
        let err = orch
            .execute_job_definition(&definition, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Worker(WorkerError::NotRegistered { .. })
        ));
        let jobs = orch
            .state
            .list_jobs(&crate::store::JobFilter::default())
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }
}
