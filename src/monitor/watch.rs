//! The aggregation loop shared by the job and step monitors.
//!
//! Each tick re-derives the terminal decision from a fresh read of the
//! watched job and its children. Events only shorten the wait between
//! ticks; the ticker alone is enough for correctness.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::JobError;
use crate::fault;
use crate::jobs::{ChildJobStats, ErrorTolerance, FailureAction, Job, JobStatus};
use crate::monitor::{FailurePolicy, WatchRegistry};
use crate::state::StateManager;
use crate::store::LogLevel;

/// What differs between watching a manager and watching a step.
#[async_trait]
pub(crate) trait WatchScope: Send + Sync + 'static {
    /// Name used in logs and crash dumps.
    fn component(&self) -> &'static str;

    fn policy(&self) -> FailurePolicy;

    fn tolerance(&self) -> Option<ErrorTolerance> {
        None
    }

    /// Publish an in-flight or final progress snapshot.
    async fn publish_progress(
        &self,
        state: &StateManager,
        job: &Job,
        status: JobStatus,
        stats: &ChildJobStats,
    );

    /// Runs once after this monitor resolved the job's terminal status.
    async fn on_resolved(
        &self,
        state: &StateManager,
        job: &Job,
        status: JobStatus,
        stats: &ChildJobStats,
    );
}

enum Tick {
    Continue,
    Done(JobStatus),
}

struct Watch<'a, S: WatchScope> {
    state: &'a StateManager,
    config: &'a MonitorConfig,
    scope: &'a S,
    job: Job,
    started: Instant,
    seen_children: bool,
    tolerance_applied: bool,
    /// Set once a `stop_all` tolerance tripped; kept until the failure is written.
    aborted: Option<String>,
}

/// Start a detached, fault-guarded watch over `job`.
///
/// The job is registered with `registry` for the lifetime of the task so
/// event handlers can nudge it.
pub(crate) fn spawn_watch<S: WatchScope>(
    state: Arc<StateManager>,
    config: MonitorConfig,
    registry: Arc<WatchRegistry>,
    job: Job,
    scope: S,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let notify = registry.register(job.id);
    tokio::spawn(async move {
        let id = job.id;
        let component = scope.component();
        let outcome = fault::guard(
            component,
            Some(id),
            config.crash_dir.as_deref(),
            run(&state, &config, &scope, job, &cancel, &notify),
        )
        .await;

        if let Err(report) = outcome {
            let reason = JobError::RecoveredFault {
                component: component.to_string(),
                id,
                message: report.message,
            }
            .to_string();
            if let Err(e) = state.fail_job(id, &reason).await {
                warn!(job_id = %id, error = %e, "Failed to mark job failed after fault");
            }
            finish(&state, id).await;
        }
        registry.release(id, &notify);
    })
}

async fn run<S: WatchScope>(
    state: &StateManager,
    config: &MonitorConfig,
    scope: &S,
    job: Job,
    cancel: &CancellationToken,
    notify: &Notify,
) -> JobStatus {
    let id = job.id;
    let mut watch = Watch {
        state,
        config,
        scope,
        job,
        started: Instant::now(),
        seen_children: false,
        tolerance_applied: false,
        aborted: None,
    };

    let deadline = tokio::time::sleep(config.max_wait);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(job_id = %id, component = scope.component(), "Monitoring started");

    loop {
        // Cancellation and the deadline are checked before any tick so a
        // ready timeout always wins over a ready grace completion.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return watch.cancelled().await,
            _ = &mut deadline => return watch.timed_out().await,
            _ = notify.notified() => {}
            _ = ticker.tick() => {}
        }
        if watch.started.elapsed() >= config.max_wait {
            return watch.timed_out().await;
        }

        if let Tick::Done(status) = watch.tick().await {
            info!(job_id = %id, status = %status, component = scope.component(), "Monitoring finished");
            return status;
        }
    }
}

impl<S: WatchScope> Watch<'_, S> {
    async fn tick(&mut self) -> Tick {
        let id = self.job.id;

        if let Err(e) = self.state.heartbeat(id).await {
            debug!(job_id = %id, error = %e, "Heartbeat failed");
        }

        // Status may have been changed out of band, e.g. a cancel request.
        match self.state.find_job(id).await {
            Ok(Some(current)) if current.status.is_terminal() => {
                debug!(job_id = %id, status = %current.status, "Job already terminal");
                finish(self.state, id).await;
                return Tick::Done(current.status);
            }
            Ok(Some(current)) => self.job = current,
            Ok(None) => {
                warn!(job_id = %id, "Watched job disappeared");
                return Tick::Done(JobStatus::Cancelled);
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to read watched job");
                return Tick::Continue;
            }
        }

        let Some(mut stats) = self.stats().await else {
            return Tick::Continue;
        };
        if stats.total > 0 {
            self.seen_children = true;
        }

        if let Some(reason) = self.apply_tolerance(&stats).await {
            stats = self.stats().await.unwrap_or(stats);
            return self.resolve(JobStatus::Failed, Some(&reason), &stats).await;
        }

        if !self.seen_children {
            if self.started.elapsed() >= self.config.no_children_grace {
                info!(job_id = %id, "No child jobs created within grace period");
                self.state
                    .add_log(id, LogLevel::Info, "No child jobs created, completing")
                    .await;
                return self.resolve(JobStatus::Completed, None, &stats).await;
            }
            return Tick::Continue;
        }

        if stats.is_settled() {
            let status = self.scope.policy().resolve(&stats);
            return self.resolve(status, None, &stats).await;
        }

        self.scope
            .publish_progress(self.state, &self.job, JobStatus::Running, &stats)
            .await;
        Tick::Continue
    }

    /// Live child counts. A failed read is treated as no data yet.
    async fn stats(&self) -> Option<ChildJobStats> {
        match self.state.child_stats(self.job.id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "Failed to read child stats");
                None
            }
        }
    }

    /// Returns the failure reason when a `stop_all` tolerance aborted the job.
    async fn apply_tolerance(&mut self, stats: &ChildJobStats) -> Option<String> {
        if self.tolerance_applied {
            return self.aborted.clone();
        }
        let tolerance = self.scope.tolerance()?;
        let action = tolerance.evaluate(stats.failed)?;
        self.tolerance_applied = true;

        let id = self.job.id;
        let message = JobError::ToleranceExceeded {
            id,
            failed: stats.failed,
            max: tolerance.max_child_failures,
        }
        .to_string();
        match action {
            FailureAction::StopAll => {
                if let Err(e) = self.state.stop_all_child_jobs(id).await {
                    warn!(job_id = %id, error = %e, "Failed to stop child jobs");
                }
                self.aborted = Some(message.clone());
                return Some(message);
            }
            FailureAction::MarkWarning => self.state.add_warning(id, &message).await,
            FailureAction::Continue => debug!(job_id = %id, "{message}"),
        }
        None
    }

    /// Write the terminal status. `reason` overrides the default failure text.
    async fn resolve(
        &mut self,
        status: JobStatus,
        reason: Option<&str>,
        stats: &ChildJobStats,
    ) -> Tick {
        let id = self.job.id;
        let written = if status == JobStatus::Failed {
            let reason = reason.map_or_else(
                || format!("{} of {} child jobs failed", stats.failed, stats.total),
                str::to_string,
            );
            self.state.fail_job(id, &reason).await
        } else {
            self.state.update_status(id, status).await
        };

        match written {
            Ok(true) => {}
            Ok(false) => {
                // Someone else resolved it first; keep their status.
                let current = self.state.find_job(id).await.ok().flatten();
                finish(self.state, id).await;
                return Tick::Done(current.map_or(status, |job| job.status));
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to write final status, retrying next tick");
                return Tick::Continue;
            }
        }

        finish(self.state, id).await;
        if let Ok(Some(job)) = self.state.find_job(id).await {
            self.job = job;
        }
        self.scope
            .publish_progress(self.state, &self.job, status, stats)
            .await;
        self.scope
            .on_resolved(self.state, &self.job, status, stats)
            .await;
        Tick::Done(status)
    }

    async fn cancelled(&self) -> JobStatus {
        let id = self.job.id;
        info!(job_id = %id, "Monitoring cancelled");
        if let Err(e) = self.state.update_status(id, JobStatus::Cancelled).await {
            warn!(job_id = %id, error = %e, "Failed to mark job cancelled");
        }
        finish(self.state, id).await;
        self.final_status(JobStatus::Cancelled).await
    }

    async fn timed_out(&self) -> JobStatus {
        let id = self.job.id;
        let waited = self.config.max_wait;
        warn!(job_id = %id, waited = ?waited, "Monitoring timed out");
        let reason = JobError::Timeout { id, waited }.to_string();
        if let Err(e) = self.state.fail_job(id, &reason).await {
            warn!(job_id = %id, error = %e, "Failed to mark job timed out");
        }
        finish(self.state, id).await;
        self.final_status(JobStatus::Failed).await
    }

    /// The stored status, which may differ from `fallback` if the job was
    /// already terminal.
    async fn final_status(&self, fallback: JobStatus) -> JobStatus {
        match self.state.find_job(self.job.id).await {
            Ok(Some(job)) if job.status.is_terminal() => job.status,
            _ => fallback,
        }
    }
}

/// Best-effort `finished_at` stamp.
async fn finish(state: &StateManager, id: Uuid) {
    if let Err(e) = state.set_finished(id).await {
        debug!(job_id = %id, error = %e, "Could not stamp finished");
    }
}

