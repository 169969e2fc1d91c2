//! Job monitor: resolves a manager job from its steps, and keeps manager
//! progress current between ticks by listening to child events.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::{Result, ValidationError};
use crate::events::{
    DocumentEvent, Event, EventHandler, EventType, JobIssue, ManagerProgress, StatusChanged,
    SubscriptionId,
};
use crate::jobs::{ChildJobStats, Job, JobStatus, JobType, ReportKind};
use crate::monitor::step_monitor::publish_step_progress;
use crate::monitor::watch::{WatchScope, spawn_watch};
use crate::monitor::{FailurePolicy, WatchRegistry};
use crate::state::StateManager;
use crate::store::LogLevel;

/// Event types the job monitor listens to.
const WATCHED_EVENTS: [EventType; 5] = [
    EventType::JobStatusChange,
    EventType::DocumentSaved,
    EventType::DocumentUpdated,
    EventType::JobError,
    EventType::JobWarning,
];

pub struct JobMonitor {
    state: Arc<StateManager>,
    config: MonitorConfig,
    registry: Arc<WatchRegistry>,
    subscriptions: Mutex<Vec<(EventType, SubscriptionId)>>,
}

impl JobMonitor {
    pub fn new(
        state: Arc<StateManager>,
        config: MonitorConfig,
        registry: Arc<WatchRegistry>,
    ) -> Self {
        Self {
            state,
            config,
            registry,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Watch a manager job until its steps settle.
    ///
    /// Malformed jobs are rejected before anything is spawned.
    pub async fn start_monitoring(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        job.validate_shape()?;
        if job.job_type != JobType::Manager {
            return Err(ValidationError::JobShape {
                id: job.id,
                reason: format!("job monitor cannot watch a {} job", job.job_type),
            }
            .into());
        }

        let mut job = self.state.get_job(job.id).await?;
        if job.status == JobStatus::Pending {
            self.state.update_status(job.id, JobStatus::Running).await?;
            job.status = JobStatus::Running;
        }

        let scope = ManagerScope {
            policy: self.config.manager_failure_policy,
        };
        Ok(spawn_watch(
            Arc::clone(&self.state),
            self.config.clone(),
            Arc::clone(&self.registry),
            job,
            scope,
            cancel,
        ))
    }

    /// Wire the process-wide child event handlers. Calling again is a no-op.
    ///
    /// Returns the number of subscriptions held.
    pub fn subscribe_to_job_events(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if !subscriptions.is_empty() {
            return subscriptions.len();
        }

        let handler: Arc<dyn EventHandler> = Arc::new(ChildEvents {
            state: Arc::clone(&self.state),
            registry: Arc::clone(&self.registry),
        });
        let bus = self.state.bus();
        for event_type in WATCHED_EVENTS {
            let id = bus.subscribe(event_type, Arc::clone(&handler));
            subscriptions.push((event_type, id));
        }
        debug!(count = subscriptions.len(), "Job monitor subscribed to job events");
        subscriptions.len()
    }

    pub fn unsubscribe_from_job_events(&self) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        for (event_type, id) in subscriptions.drain(..) {
            self.state.bus().unsubscribe(event_type, id);
        }
    }
}

/// Publish a ManagerProgress snapshot for `job`.
pub(crate) fn publish_manager_progress(
    state: &StateManager,
    job: &Job,
    status: JobStatus,
    stats: &ChildJobStats,
) {
    state.emit(Event::ManagerProgress(ManagerProgress::new(
        job.id,
        status,
        stats,
        job.document_count(),
        job.status_report(),
    )));
}

struct ManagerScope {
    policy: FailurePolicy,
}

#[async_trait]
impl WatchScope for ManagerScope {
    fn component(&self) -> &'static str {
        "job_monitor"
    }

    fn policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn publish_progress(
        &self,
        state: &StateManager,
        job: &Job,
        status: JobStatus,
        stats: &ChildJobStats,
    ) {
        publish_manager_progress(state, job, status, stats);
    }

    async fn on_resolved(
        &self,
        state: &StateManager,
        job: &Job,
        status: JobStatus,
        stats: &ChildJobStats,
    ) {
        let documents = job.document_count();
        info!(
            job_id = %job.id,
            status = %status,
            steps = stats.total,
            documents,
            "Manager job resolved"
        );
        state
            .add_log(
                job.id,
                LogLevel::Info,
                format!("Job {status}: {} steps, {documents} documents", stats.total),
            )
            .await;
    }
}

/// Fast path between ticks: recompute and republish on child events.
struct ChildEvents {
    state: Arc<StateManager>,
    registry: Arc<WatchRegistry>,
}

#[async_trait]
impl EventHandler for ChildEvents {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::StatusChanged(payload) => self.on_child_status(payload).await,
            Event::DocumentSaved(payload) => self.on_document_saved(payload).await,
            Event::DocumentUpdated(payload) => {
                // Updates never change counts.
                debug!(job_id = %payload.job_id, document_id = %payload.document_id, "Document updated");
                Ok(())
            }
            Event::JobError(issue) => self.on_issue(issue, ReportKind::Error).await,
            Event::JobWarning(issue) => self.on_issue(issue, ReportKind::Warning).await,
            _ => Ok(()),
        }
    }
}

impl ChildEvents {
    async fn on_child_status(&self, payload: &StatusChanged) -> anyhow::Result<()> {
        let Some(parent_id) = payload.parent_id else {
            return Ok(());
        };
        let Some(parent) = self.state.find_job(parent_id).await? else {
            return Ok(());
        };
        let stats = self.state.child_stats(parent_id).await?;

        let short: String = payload.job_id.to_string().chars().take(8).collect();
        self.state
            .add_log(
                parent_id,
                LogLevel::Info,
                format!("Child job {short} → {}. {}", payload.status, stats.progress_text()),
            )
            .await;

        let status = live_status(&parent);
        match parent.job_type {
            JobType::Step => publish_step_progress(&self.state, &parent, status, &stats),
            JobType::Manager => publish_manager_progress(&self.state, &parent, status, &stats),
            JobType::Worker => {}
        }
        self.registry.nudge(parent_id);
        Ok(())
    }

    /// Count the document on its originating job and on the manager.
    async fn on_document_saved(&self, payload: &DocumentEvent) -> anyhow::Result<()> {
        let origin = self.state.find_job(payload.job_id).await?;
        let manager_id = origin.as_ref().map_or(payload.parent_job_id, Job::root_id);

        if origin.is_some() && payload.job_id != manager_id {
            self.state.increment_document_count(payload.job_id).await?;
        }
        let count = self.state.increment_document_count(manager_id).await?;
        debug!(job_id = %manager_id, document_id = %payload.document_id, count, "Document saved");

        self.republish_manager(manager_id).await
    }

    async fn on_issue(&self, issue: &JobIssue, kind: ReportKind) -> anyhow::Result<()> {
        let root = match self.state.find_job(issue.job_id).await? {
            Some(job) => job.root_id(),
            None => issue.parent_job_id.unwrap_or(issue.job_id),
        };

        match kind {
            ReportKind::Error => self.state.add_error(root, &issue.message).await,
            ReportKind::Warning => self.state.add_warning(root, &issue.message).await,
        }
        if issue.job_id != root {
            let level = match kind {
                ReportKind::Error => LogLevel::Error,
                ReportKind::Warning => LogLevel::Warn,
            };
            self.state.add_log(issue.job_id, level, issue.message.as_str()).await;
        }

        self.republish_manager(root).await
    }

    async fn republish_manager(&self, manager_id: Uuid) -> anyhow::Result<()> {
        let Some(manager) = self.state.find_job(manager_id).await? else {
            return Ok(());
        };
        let stats = self.state.child_stats(manager_id).await?;
        publish_manager_progress(&self.state, &manager, live_status(&manager), &stats);
        Ok(())
    }
}

/// Status to report for a parent: its own once terminal, else running.
fn live_status(job: &Job) -> JobStatus {
    if job.status.is_terminal() {
        job.status
    } else {
        JobStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryStore;

    struct Fixture {
        state: Arc<StateManager>,
        monitor: JobMonitor,
        manager: Job,
        step: Job,
        worker: Job,
    }

    async fn fixture() -> Fixture {
        let state = Arc::new(StateManager::new(
            Arc::new(MemoryStore::new()),
            EventBus::new(),
        ));
        let manager = Job::manager("crawl");
        let step = Job::step(&manager, "fetch");
        let worker = Job::worker(&step, "url-1");
        for job in [&manager, &step, &worker] {
            state.create_job(job).await.unwrap();
        }
        let monitor = JobMonitor::new(
            Arc::clone(&state),
            MonitorConfig::default(),
            WatchRegistry::new(),
        );
        Fixture {
            state,
            monitor,
            manager,
            step,
            worker,
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn rejects_step_jobs() {
        let f = fixture().await;
        assert!(
            f.monitor
                .start_monitoring(&f.step, CancellationToken::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn subscribing_twice_is_a_no_op() {
        let f = fixture().await;
        assert_eq!(f.monitor.subscribe_to_job_events(), WATCHED_EVENTS.len());
        assert_eq!(f.monitor.subscribe_to_job_events(), WATCHED_EVENTS.len());
        assert_eq!(f.state.bus().subscriber_count(EventType::DocumentSaved), 1);
        f.monitor.unsubscribe_from_job_events();
        assert_eq!(f.state.bus().subscriber_count(EventType::DocumentSaved), 0);
    }

    #[tokio::test]
    async fn document_saved_counts_on_worker_and_manager() {
        let f = fixture().await;
        f.monitor.subscribe_to_job_events();
        for n in 0..3 {
            f.state.emit(Event::DocumentSaved(DocumentEvent::new(
                f.worker.id,
                f.manager.id,
                format!("doc-{n}"),
            )));
        }
        f.state.emit(Event::DocumentUpdated(DocumentEvent::new(
            f.worker.id,
            f.manager.id,
            "doc-0",
        )));

        let state = Arc::clone(&f.state);
        let manager_id = f.manager.id;
        eventually(|| {
            let state = Arc::clone(&state);
            async move { state.get_job(manager_id).await.unwrap().document_count() == 3 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.state.get_job(f.manager.id).await.unwrap().document_count(), 3);
        assert_eq!(f.state.get_job(f.worker.id).await.unwrap().document_count(), 3);
    }

    #[tokio::test]
    async fn child_status_change_logs_on_parent() {
        let f = fixture().await;
        f.monitor.subscribe_to_job_events();
        f.state
            .update_status(f.worker.id, JobStatus::Completed)
            .await
            .unwrap();

        let state = Arc::clone(&f.state);
        let step_id = f.step.id;
        eventually(|| {
            let state = Arc::clone(&state);
            async move {
                state
                    .job_logs(step_id, 10)
                    .await
                    .unwrap()
                    .iter()
                    .any(|entry| entry.message.starts_with("Child job "))
            }
        })
        .await;
        let logs = f.state.job_logs(f.step.id, 10).await.unwrap();
        let line = logs
            .iter()
            .find(|entry| entry.message.starts_with("Child job "))
            .unwrap();
        assert!(line.message.contains("→ completed. 0 pending, 0 running, 1 completed, 0 failed"));
    }

    #[tokio::test]
    async fn worker_warning_lands_on_root_report() {
        let f = fixture().await;
        f.monitor.subscribe_to_job_events();
        f.state.emit(Event::JobWarning(JobIssue::new(
            f.worker.id,
            Some(f.step.id),
            "rate limited",
        )));

        let state = Arc::clone(&f.state);
        let manager_id = f.manager.id;
        eventually(|| {
            let state = Arc::clone(&state);
            async move {
                !state
                    .get_job(manager_id)
                    .await
                    .unwrap()
                    .status_report()
                    .warnings
                    .is_empty()
            }
        })
        .await;
        let report = f.state.get_job(f.manager.id).await.unwrap().status_report();
        assert_eq!(report.warnings, vec!["rate limited"]);
    }
}
