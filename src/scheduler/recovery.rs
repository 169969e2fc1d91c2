//! Startup orphan cleanup and periodic stale-job detection.

use std::str::FromStr;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{Job, JobStatus};
use crate::state::StateManager;
use crate::store::JobFilter;

/// Reason recorded on jobs left running by a previous process.
pub const ORPHAN_REASON: &str = "Service restarted while job was running";

/// What to do with jobs still marked running at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Mark them failed.
    #[default]
    Fail,
    /// Move them back to pending so they run again.
    Requeue,
}

impl std::fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => f.write_str("fail"),
            Self::Requeue => f.write_str("requeue"),
        }
    }
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "fail" => Ok(Self::Fail),
            "requeue" => Ok(Self::Requeue),
            other => Err(format!("unknown orphan policy: {other}")),
        }
    }
}

/// An in-memory owner of running jobs, consulted before touching storage.
#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    /// Fail a job this tracker still owns.
    ///
    /// Returns `false` when the job is not tracked here.
    async fn fail_tracked(&self, job_id: Uuid, reason: &str) -> anyhow::Result<bool>;
}

/// Resolve every job left running from a prior process lifetime.
pub async fn cleanup_orphaned_jobs(state: &StateManager, policy: OrphanPolicy) -> Result<usize> {
    let cleaned = match policy {
        OrphanPolicy::Requeue => state.requeue_running_jobs(ORPHAN_REASON).await?,
        OrphanPolicy::Fail => {
            let running = state.list_jobs(&JobFilter::with_status(JobStatus::Running)).await?;
            let mut failed = 0;
            for job in &running {
                if fail_directly(state, job, ORPHAN_REASON).await {
                    failed += 1;
                }
            }
            failed
        }
    };
    if cleaned > 0 {
        warn!(count = cleaned, policy = %policy, "Cleaned up orphaned jobs");
    } else {
        info!("No orphaned jobs found");
    }
    Ok(cleaned)
}

/// Fail running jobs whose heartbeat is older than `threshold_minutes`.
///
/// The tracker gets the first chance so a live owner can shut the job
/// down itself; storage is the fallback.
pub async fn detect_stale_jobs(
    state: &StateManager,
    tracker: Option<&dyn ExecutionTracker>,
    threshold_minutes: i64,
) -> Result<usize> {
    let stale = state.stale_jobs(threshold_minutes).await?;
    if stale.is_empty() {
        return Ok(0);
    }

    let reason = format!("Job stale (no heartbeat for {threshold_minutes}+ minutes)");
    let mut resolved = 0;
    for job in &stale {
        let tracked = match tracker {
            Some(tracker) => match tracker.fail_tracked(job.id, &reason).await {
                Ok(tracked) => tracked,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Execution tracker failed, using storage");
                    false
                }
            },
            None => false,
        };
        if tracked || fail_directly(state, job, &reason).await {
            resolved += 1;
        }
    }
    warn!(count = resolved, found = stale.len(), "Resolved stale jobs");
    Ok(resolved)
}

async fn fail_directly(state: &StateManager, job: &Job, reason: &str) -> bool {
    match state.fail_job(job.id, reason).await {
        Ok(applied) => {
            if let Err(e) = state.set_finished(job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to stamp finished");
            }
            applied
        }
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Failed to mark job failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryStore;

    fn state() -> StateManager {
        StateManager::new(Arc::new(MemoryStore::new()), EventBus::new())
    }

    async fn running_job(state: &StateManager, minutes_ago: i64) -> Job {
        let mut job = Job::manager("crawl");
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(minutes_ago));
        state.create_job(&job).await.unwrap();
        job
    }

    struct Tracker {
        owned: Uuid,
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ExecutionTracker for Tracker {
        async fn fail_tracked(&self, job_id: Uuid, _reason: &str) -> anyhow::Result<bool> {
            self.seen.lock().unwrap().push(job_id);
            Ok(job_id == self.owned)
        }
    }

    #[tokio::test]
    async fn orphans_fail_with_restart_reason() {
        let state = state();
        let job = running_job(&state, 1).await;
        assert_eq!(cleanup_orphaned_jobs(&state, OrphanPolicy::Fail).await.unwrap(), 1);

        let job = state.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(ORPHAN_REASON));
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn orphans_requeue_to_pending() {
        let state = state();
        let job = running_job(&state, 1).await;
        assert_eq!(cleanup_orphaned_jobs(&state, OrphanPolicy::Requeue).await.unwrap(), 1);
        assert_eq!(state.get_job(job.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn stale_jobs_prefer_tracker_then_storage() {
        let state = state();
        let tracked = running_job(&state, 30).await;
        let untracked = running_job(&state, 30).await;
        let fresh = running_job(&state, 1).await;
        let tracker = Tracker {
            owned: tracked.id,
            seen: Mutex::new(Vec::new()),
        };

        let resolved = detect_stale_jobs(&state, Some(&tracker), 10).await.unwrap();
        assert_eq!(resolved, 2);
        assert_eq!(tracker.seen.lock().unwrap().len(), 2);

        // The tracker owns `tracked`, so storage was left alone for it.
        assert_eq!(state.get_job(tracked.id).await.unwrap().status, JobStatus::Running);
        let untracked = state.get_job(untracked.id).await.unwrap();
        assert_eq!(untracked.status, JobStatus::Failed);
        assert_eq!(
            untracked.error.as_deref(),
            Some("Job stale (no heartbeat for 10+ minutes)")
        );
        assert_eq!(state.get_job(fresh.id).await.unwrap().status, JobStatus::Running);
    }

    #[test]
    fn policy_parses() {
        assert_eq!("requeue".parse::<OrphanPolicy>().unwrap(), OrphanPolicy::Requeue);
        assert!("ignore".parse::<OrphanPolicy>().is_err());
    }
}
