//! Cron-driven execution of named jobs and job definitions.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::recovery::{self, ExecutionTracker};
use super::schedule::CronSchedule;
use crate::config::SchedulerConfig;
use crate::dispatch::Orchestrator;
use crate::error::{EventError, Result, SchedulerError};
use crate::events::{CollectionTriggered, Event};
use crate::fault;
use crate::jobs::JobDefinition;
use crate::state::StateManager;

/// Settings key prefix for persisted per-job scheduling state.
pub const SETTINGS_PREFIX: &str = "job_settings:";

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Registration request for a named job.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub schedule: String,
    pub description: String,
    pub enabled: bool,
    /// Run once as soon as the scheduler starts.
    pub auto_start: bool,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            description: String::new(),
            enabled: true,
            auto_start: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// Point-in-time view of a named job.
#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleStatus {
    pub name: String,
    pub schedule: String,
    pub description: String,
    pub enabled: bool,
    pub auto_start: bool,
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedJobSettings {
    job_name: String,
    schedule: String,
    #[serde(default)]
    description: String,
    enabled: bool,
    #[serde(default)]
    auto_start: bool,
    #[serde(default)]
    last_run: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

struct Entry {
    schedule: CronSchedule,
    description: String,
    handler: TaskHandler,
    enabled: bool,
    auto_start: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    running: Arc<AtomicBool>,
}

impl Entry {
    fn reschedule(&mut self, now: DateTime<Utc>) {
        self.next_run = if self.enabled {
            self.schedule.next_after(now)
        } else {
            None
        };
    }

    fn status(&self, name: &str) -> JobScheduleStatus {
        JobScheduleStatus {
            name: name.to_string(),
            schedule: self.schedule.expression().to_string(),
            description: self.description.clone(),
            enabled: self.enabled,
            auto_start: self.auto_start,
            is_running: self.running.load(Ordering::Acquire),
            last_run: self.last_run,
            next_run: self.next_run,
            last_error: self.last_error.clone(),
        }
    }

    fn persisted(&self, name: &str) -> PersistedJobSettings {
        PersistedJobSettings {
            job_name: name.to_string(),
            schedule: self.schedule.expression().to_string(),
            description: self.description.clone(),
            enabled: self.enabled,
            auto_start: self.auto_start,
            last_run: self.last_run,
            updated_at: Utc::now(),
        }
    }
}

/// Runs named jobs on their cron schedules.
///
/// Named jobs share a global lock for reading; the legacy collection task
/// takes it exclusively, so the two never overlap. The legacy task only
/// runs while no named jobs are registered.
pub struct SchedulerService {
    state: Arc<StateManager>,
    config: SchedulerConfig,
    crash_dir: Option<PathBuf>,
    tracker: Option<Arc<dyn ExecutionTracker>>,
    entries: RwLock<HashMap<String, Entry>>,
    global: RwLock<()>,
    legacy_schedule: Option<CronSchedule>,
    legacy_next: std::sync::Mutex<Option<DateTime<Utc>>>,
    legacy_processing: AtomicBool,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Clears a job's running flag however `execute` exits.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SchedulerService {
    pub fn new(state: Arc<StateManager>, config: SchedulerConfig) -> Self {
        let legacy_schedule = if config.legacy_schedule.trim().is_empty() {
            None
        } else {
            match CronSchedule::parse(&config.legacy_schedule) {
                Ok(schedule) => Some(schedule),
                Err(e) => {
                    warn!(error = %e, "Legacy collection schedule invalid, task disabled");
                    None
                }
            }
        };
        Self {
            state,
            config,
            crash_dir: None,
            tracker: None,
            entries: RwLock::new(HashMap::new()),
            global: RwLock::new(()),
            legacy_schedule,
            legacy_next: std::sync::Mutex::new(None),
            legacy_processing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExecutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_crash_dir(mut self, crash_dir: Option<PathBuf>) -> Self {
        self.crash_dir = crash_dir;
        self
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a named job. Persisted settings for the same name win over
    /// the values passed in.
    pub async fn register_job<F, Fut>(&self, job: ScheduledJob, handler: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let schedule =
            CronSchedule::parse_with_min_interval(&job.schedule, self.config.min_schedule_interval)?;
        let handler: TaskHandler = Arc::new(move || Box::pin(handler()) as TaskFuture);
        let mut entry = Entry {
            schedule,
            description: job.description,
            handler,
            enabled: job.enabled,
            auto_start: job.auto_start,
            last_run: None,
            next_run: None,
            last_error: None,
            running: Arc::new(AtomicBool::new(false)),
        };
        if let Some(saved) = self.load_persisted(&job.name).await {
            self.apply_persisted(&job.name, &mut entry, saved);
        }
        entry.reschedule(Utc::now());

        let snapshot = {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&job.name) {
                return Err(SchedulerError::AlreadyRegistered(job.name).into());
            }
            let snapshot = entry.persisted(&job.name);
            entries.insert(job.name.clone(), entry);
            snapshot
        };
        self.persist(&snapshot).await;
        info!(job = %job.name, schedule = %snapshot.schedule, "Registered scheduled job");
        Ok(())
    }

    /// Register every scheduled definition as a named job that runs it
    /// through `orchestrator`. On-demand definitions are skipped.
    pub async fn load_job_definitions(
        &self,
        definitions: Vec<JobDefinition>,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<usize> {
        let mut registered = 0;
        for definition in definitions {
            if definition.is_on_demand() {
                debug!(definition = %definition.id, "On-demand definition, not scheduled");
                continue;
            }
            let job = ScheduledJob::new(definition.id.clone(), definition.schedule.clone())
                .with_description(definition.description.clone())
                .enabled(definition.enabled)
                .auto_start(definition.auto_start);

            let definition = Arc::new(definition);
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown = self.shutdown.clone();
            let handler = move || {
                let definition = Arc::clone(&definition);
                let orchestrator = Arc::clone(&orchestrator);
                let cancel = shutdown.child_token();
                async move {
                    orchestrator.execute_job_definition(&definition, cancel).await?;
                    anyhow::Ok(())
                }
            };
            match self.register_job(job, handler).await {
                Ok(()) => registered += 1,
                Err(e) => warn!(error = %e, "Skipping job definition"),
            }
        }
        info!(count = registered, "Loaded scheduled job definitions");
        Ok(registered)
    }

    /// Re-apply persisted settings to every registered job.
    pub async fn load_job_settings(&self) -> Result<usize> {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut applied = 0;
        for name in names {
            let Some(saved) = self.load_persisted(&name).await else {
                continue;
            };
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(&name) {
                self.apply_persisted(&name, entry, saved);
                entry.reschedule(Utc::now());
                applied += 1;
            }
        }
        Ok(applied)
    }

    // ── Control ─────────────────────────────────────────────────────

    pub async fn enable_job(&self, name: &str) -> Result<()> {
        self.update_job(name, None, None, Some(true)).await
    }

    pub async fn disable_job(&self, name: &str) -> Result<()> {
        self.update_job(name, None, None, Some(false)).await
    }

    pub async fn update_job_schedule(&self, name: &str, schedule: &str) -> Result<()> {
        self.update_job(name, None, Some(schedule), None).await
    }

    /// Change any of a job's settings and persist the result.
    pub async fn update_job(
        &self,
        name: &str,
        description: Option<&str>,
        schedule: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<()> {
        let parsed = schedule
            .map(|s| CronSchedule::parse_with_min_interval(s, self.config.min_schedule_interval))
            .transpose()?;
        let snapshot = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
            if let Some(description) = description {
                entry.description = description.to_string();
            }
            if let Some(schedule) = parsed {
                entry.schedule = schedule;
            }
            if let Some(enabled) = enabled {
                entry.enabled = enabled;
            }
            entry.reschedule(Utc::now());
            entry.persisted(name)
        };
        self.persist(&snapshot).await;
        info!(job = %name, schedule = %snapshot.schedule, enabled = snapshot.enabled, "Updated scheduled job");
        Ok(())
    }

    pub async fn get_job_status(&self, name: &str) -> Result<JobScheduleStatus> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        Ok(entry.status(name))
    }

    pub async fn get_all_job_statuses(&self) -> Vec<JobScheduleStatus> {
        let entries = self.entries.read().await;
        let mut statuses: Vec<JobScheduleStatus> = entries
            .iter()
            .map(|(name, entry)| entry.status(name))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Run a named job now, outside its schedule.
    pub async fn trigger_job(self: &Arc<Self>, name: &str) -> Result<JoinHandle<()>> {
        Ok(self.launch(name).await?)
    }

    /// Publish a collection trigger, waiting for every named job to finish
    /// first.
    pub async fn trigger_collection_now(&self) -> Result<()> {
        let _exclusive = self.global.write().await;
        self.publish_collection("manual").await?;
        Ok(())
    }

    // ── Recovery ────────────────────────────────────────────────────

    pub async fn cleanup_orphaned_jobs(&self) -> Result<usize> {
        recovery::cleanup_orphaned_jobs(&self.state, self.config.orphan_policy).await
    }

    pub async fn detect_stale_jobs(&self) -> Result<usize> {
        recovery::detect_stale_jobs(
            &self.state,
            self.tracker.as_deref(),
            self.config.stale_threshold_minutes,
        )
        .await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the cron ticker and the stale-job sweep, then run auto-start
    /// jobs.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyStarted.into());
        }
        if let Some(schedule) = &self.legacy_schedule
            && let Ok(mut next) = self.legacy_next.lock()
        {
            *next = schedule.next_after(Utc::now());
        }

        let auto: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.enabled && entry.auto_start)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &auto {
            if let Err(e) = self.launch(name).await {
                warn!(job = %name, error = %e, "Auto-start skipped");
            }
        }

        let ticker = spawn_scheduler_ticker(Arc::clone(self), self.config.tick_interval);
        let sweeper = spawn_stale_sweep(Arc::clone(self), self.config.stale_sweep_interval);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend([ticker, sweeper]);
        }
        info!(
            jobs = self.entries.read().await.len(),
            auto_started = auto.len(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop the background loops. Jobs already running finish on their own.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }

    /// Launch every enabled job whose next run is at or before `now`.
    ///
    /// Returns how many were launched. A job still running from its last
    /// fire is skipped and rescheduled.
    pub async fn check_due(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let (due, has_named) = {
            let mut entries = self.entries.write().await;
            let mut due = Vec::new();
            for (name, entry) in entries.iter_mut() {
                if !entry.enabled || !entry.next_run.is_some_and(|at| at <= now) {
                    continue;
                }
                entry.next_run = entry.schedule.next_after(now);
                if entry.running.load(Ordering::Acquire) {
                    debug!(job = %name, "Previous run still executing, skipping");
                    continue;
                }
                due.push(name.clone());
            }
            (due, !entries.is_empty())
        };

        let mut launched = 0;
        for name in due {
            match self.launch(&name).await {
                Ok(_) => launched += 1,
                Err(e) => debug!(job = %name, error = %e, "Not launched"),
            }
        }
        if !has_named && self.legacy_due(now) {
            self.run_legacy();
        }
        launched
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn launch(self: &Arc<Self>, name: &str) -> std::result::Result<JoinHandle<()>, SchedulerError> {
        let (handler, running) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(name)
                .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
            (Arc::clone(&entry.handler), Arc::clone(&entry.running))
        };
        if running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyExecuting(name.to_string()));
        }
        let this = Arc::clone(self);
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            this.execute(&name, handler, running).await;
        }))
    }

    async fn execute(&self, name: &str, handler: TaskHandler, running: Arc<AtomicBool>) {
        let running = RunningFlag(running);
        let _shared = self.global.read().await;
        let started = Utc::now();
        info!(job = %name, "Scheduled job started");

        // The handler itself may panic before handing back a future.
        let outcome = fault::guard("scheduler", None, self.crash_dir.as_deref(), async move {
            handler().await
        })
        .await;
        let last_error = match outcome {
            Ok(Ok(())) => {
                info!(job = %name, elapsed_ms = (Utc::now() - started).num_milliseconds(), "Scheduled job finished");
                None
            }
            Ok(Err(e)) => {
                error!(job = %name, error = %e, "Scheduled job failed");
                Some(SchedulerError::TaskFailed(format!("{e:#}")).to_string())
            }
            Err(report) => {
                error!(job = %name, fault = %report.message, "Scheduled job panicked");
                Some(
                    SchedulerError::TaskFailed(format!("recovered fault: {}", report.message))
                        .to_string(),
                )
            }
        };

        let snapshot = {
            let mut entries = self.entries.write().await;
            entries.get_mut(name).map(|entry| {
                entry.last_run = Some(started);
                entry.last_error = last_error;
                entry.persisted(name)
            })
        };
        drop(running);
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }
    }

    fn legacy_due(&self, now: DateTime<Utc>) -> bool {
        let Some(schedule) = &self.legacy_schedule else {
            return false;
        };
        let Ok(mut next) = self.legacy_next.lock() else {
            return false;
        };
        match *next {
            Some(at) if at <= now => {
                *next = schedule.next_after(now);
                true
            }
            Some(_) => false,
            None => {
                *next = schedule.next_after(now);
                false
            }
        }
    }

    fn run_legacy(self: &Arc<Self>) {
        if self.legacy_processing.swap(true, Ordering::AcqRel) {
            info!("Legacy collection still processing, skipping");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _exclusive = this.global.write().await;
            let outcome = fault::guard(
                "scheduler.legacy",
                None,
                this.crash_dir.as_deref(),
                this.publish_collection("scheduler"),
            )
            .await;
            if let Ok(Err(e)) = outcome {
                warn!(error = %e, "Legacy collection trigger failed");
            }
            this.legacy_processing.store(false, Ordering::Release);
        });
    }

    async fn publish_collection(&self, triggered_by: &str) -> std::result::Result<(), EventError> {
        debug!(triggered_by, "Publishing collection trigger");
        self.state
            .bus()
            .publish_sync(Event::CollectionTriggered(CollectionTriggered {
                triggered_by: triggered_by.to_string(),
                timestamp: Utc::now(),
            }))
            .await
    }

    fn apply_persisted(&self, name: &str, entry: &mut Entry, saved: PersistedJobSettings) {
        match CronSchedule::parse_with_min_interval(&saved.schedule, self.config.min_schedule_interval) {
            Ok(schedule) => entry.schedule = schedule,
            Err(e) => warn!(job = %name, error = %e, "Ignoring persisted schedule"),
        }
        if !saved.description.is_empty() {
            entry.description = saved.description;
        }
        entry.enabled = saved.enabled;
        entry.auto_start = saved.auto_start;
        entry.last_run = saved.last_run.or(entry.last_run);
    }

    async fn load_persisted(&self, name: &str) -> Option<PersistedJobSettings> {
        let key = format!("{SETTINGS_PREFIX}{name}");
        match self.state.store().get_setting(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    warn!(job = %name, error = %e, "Unreadable persisted job settings");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(job = %name, error = %e, "Failed to load job settings");
                None
            }
        }
    }

    async fn persist(&self, settings: &PersistedJobSettings) {
        let key = format!("{SETTINGS_PREFIX}{}", settings.job_name);
        let raw = match serde_json::to_string(settings) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(job = %settings.job_name, error = %e, "Failed to encode job settings");
                return;
            }
        };
        if let Err(e) = self.state.store().set_setting(&key, &raw).await {
            warn!(job = %settings.job_name, error = %e, "Failed to persist job settings");
        }
    }
}

/// Check due jobs every `interval` until shutdown.
fn spawn_scheduler_ticker(scheduler: Arc<SchedulerService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = scheduler.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    scheduler.check_due(Utc::now()).await;
                }
            }
        }
    })
}

fn spawn_stale_sweep(scheduler: Arc<SchedulerService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = scheduler.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let crash_dir = scheduler.crash_dir.clone();
                    let sweep = fault::guard(
                        "scheduler.stale_sweep",
                        None,
                        crash_dir.as_deref(),
                        scheduler.detect_stale_jobs(),
                    )
                    .await;
                    if let Ok(Err(e)) = sweep {
                        warn!(error = %e, "Stale job sweep failed");
                    }
                }
            }
        }
    })
}
