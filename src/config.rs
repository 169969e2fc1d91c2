//! Configuration types.
//!
//! Every struct has a `Default` and a `from_env()` that overrides
//! individual fields from `INGEST_*` variables. Unset variables keep the
//! default; set-but-invalid ones are an error.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::monitor::FailurePolicy;
use crate::scheduler::OrphanPolicy;

/// Lookup used by the `from_env` constructors. Swappable in tests.
type Source<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T>(source: Source<'_>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = source(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        })
}

fn secs(source: Source<'_>, key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(source, key)?.map(Duration::from_secs))
}

fn millis(source: Source<'_>, key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(source, key)?.map(Duration::from_millis))
}

// ── Monitors ────────────────────────────────────────────────────────

/// Job and step monitor timing.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between aggregation ticks.
    pub poll_interval: Duration,
    /// Hard limit on how long one monitor waits for its children.
    pub max_wait: Duration,
    /// How long a parent may have no children before it is completed.
    pub no_children_grace: Duration,
    pub manager_failure_policy: FailurePolicy,
    pub step_failure_policy: FailurePolicy,
    /// Where recovered-fault dumps are written. Logged only when unset.
    pub crash_dir: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(1800), // 30 minutes
            no_children_grace: Duration::from_secs(30),
            manager_failure_policy: FailurePolicy::AnyFailed,
            step_failure_policy: FailurePolicy::AllFailed,
            crash_dir: None,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&process_env)
    }

    fn from_source(source: Source<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: millis(source, "INGEST_MONITOR_POLL_MS")?
                .unwrap_or(defaults.poll_interval),
            max_wait: secs(source, "INGEST_MONITOR_MAX_WAIT_SECS")?.unwrap_or(defaults.max_wait),
            no_children_grace: secs(source, "INGEST_MONITOR_GRACE_SECS")?
                .unwrap_or(defaults.no_children_grace),
            manager_failure_policy: parse(source, "INGEST_MANAGER_FAILURE_POLICY")?
                .unwrap_or(defaults.manager_failure_policy),
            step_failure_policy: parse(source, "INGEST_STEP_FAILURE_POLICY")?
                .unwrap_or(defaults.step_failure_policy),
            crash_dir: source("INGEST_CRASH_DIR").map(PathBuf::from),
        })
    }
}

// ── Scheduler ───────────────────────────────────────────────────────

/// Cron scheduler and stale-job sweep settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due cron entries are checked.
    pub tick_interval: Duration,
    pub stale_sweep_interval: Duration,
    /// Jobs without a heartbeat for this long are failed.
    pub stale_threshold_minutes: i64,
    /// Schedules firing more often than this are rejected.
    pub min_schedule_interval: Duration,
    /// Schedule of the legacy collection task.
    pub legacy_schedule: String,
    pub orphan_policy: OrphanPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            stale_sweep_interval: Duration::from_secs(300), // 5 minutes
            stale_threshold_minutes: 10,
            min_schedule_interval: Duration::from_secs(300), // 5 minutes
            legacy_schedule: "*/5 * * * *".to_string(),
            orphan_policy: OrphanPolicy::Fail,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&process_env)
    }

    fn from_source(source: Source<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval: millis(source, "INGEST_SCHEDULER_TICK_MS")?
                .unwrap_or(defaults.tick_interval),
            stale_sweep_interval: secs(source, "INGEST_STALE_SWEEP_SECS")?
                .unwrap_or(defaults.stale_sweep_interval),
            stale_threshold_minutes: parse(source, "INGEST_STALE_THRESHOLD_MINUTES")?
                .unwrap_or(defaults.stale_threshold_minutes),
            min_schedule_interval: secs(source, "INGEST_MIN_SCHEDULE_SECS")?
                .unwrap_or(defaults.min_schedule_interval),
            legacy_schedule: source("INGEST_LEGACY_SCHEDULE").unwrap_or(defaults.legacy_schedule),
            orphan_policy: parse(source, "INGEST_ORPHAN_POLICY")?.unwrap_or(defaults.orphan_policy),
        })
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

/// Retry behavior for steps using the `retry` error strategy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts after the first failure.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub retry_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&process_env)
    }

    fn from_source(source: Source<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            retry_attempts: parse(source, "INGEST_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.retry_attempts),
            retry_backoff: millis(source, "INGEST_RETRY_BACKOFF_MS")?
                .unwrap_or(defaults.retry_backoff),
        })
    }
}

// ── Storage ─────────────────────────────────────────────────────────

/// Where job records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local(PathBuf),
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local(PathBuf::from("./data/ingest.db"))
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self::from_source(&process_env)
    }

    fn from_source(source: Source<'_>) -> Self {
        match source("INGEST_DB_PATH") {
            Some(path) if path == ":memory:" => Self::Memory,
            Some(path) => Self::Local(PathBuf::from(path)),
            None => Self::default(),
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

/// Everything the binary needs.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
    /// Daily-rotated log files are written here when set.
    pub log_dir: Option<PathBuf>,
    /// JSON file holding an array of job definitions to schedule.
    pub definitions_path: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&process_env)
    }

    fn from_source(source: Source<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            monitor: MonitorConfig::from_source(source)?,
            scheduler: SchedulerConfig::from_source(source)?,
            dispatch: DispatchConfig::from_source(source)?,
            storage: StorageConfig::from_source(source),
            log_dir: source("INGEST_LOG_DIR").map(PathBuf::from),
            definitions_path: source("INGEST_DEFINITIONS").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = OrchestratorConfig::from_source(&source(&[])).unwrap();
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(5));
        assert_eq!(config.monitor.max_wait, Duration::from_secs(1800));
        assert_eq!(config.monitor.step_failure_policy, FailurePolicy::AllFailed);
        assert_eq!(config.scheduler.stale_threshold_minutes, 10);
        assert_eq!(config.dispatch.retry_attempts, 3);
        assert_eq!(config.storage, StorageConfig::default());
        assert!(config.log_dir.is_none());
        assert!(config.definitions_path.is_none());
    }

    #[test]
    fn overrides_apply() {
        let env = source(&[
            ("INGEST_MONITOR_POLL_MS", "250"),
            ("INGEST_STEP_FAILURE_POLICY", "none_succeeded"),
            ("INGEST_ORPHAN_POLICY", "requeue"),
            ("INGEST_DB_PATH", ":memory:"),
            ("INGEST_CRASH_DIR", "/tmp/crashes"),
        ]);
        let config = OrchestratorConfig::from_source(&env).unwrap();
        assert_eq!(config.monitor.poll_interval, Duration::from_millis(250));
        assert_eq!(config.monitor.step_failure_policy, FailurePolicy::NoneSucceeded);
        assert_eq!(config.scheduler.orphan_policy, OrphanPolicy::Requeue);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.monitor.crash_dir, Some(PathBuf::from("/tmp/crashes")));
    }

    #[test]
    fn invalid_value_names_the_key() {
        let env = source(&[("INGEST_RETRY_ATTEMPTS", "lots")]);
        let err = DispatchConfig::from_source(&env).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "INGEST_RETRY_ATTEMPTS"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
