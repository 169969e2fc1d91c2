//! Job and step monitors.
//!
//! A monitor owns one parent job and resolves its terminal status from
//! its direct children. Job monitors watch managers; step monitors watch
//! steps.

pub mod job_monitor;
pub mod policy;
pub mod step_monitor;
mod watch;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use uuid::Uuid;

pub use job_monitor::JobMonitor;
pub use policy::FailurePolicy;
pub use step_monitor::StepMonitor;

/// Active watches, keyed by the watched job.
///
/// Event handlers use this to wake a watch for an immediate recompute
/// instead of waiting for its next tick. Each watch holds its own
/// `Notify`, so several watches over one job come and go independently.
#[derive(Default)]
pub struct WatchRegistry {
    watches: Mutex<HashMap<Uuid, Vec<Arc<Notify>>>>,
}

impl WatchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, job_id: Uuid) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id)
            .or_default()
            .push(Arc::clone(&notify));
        notify
    }

    /// Drop the watch that was handed `notify`; other watches on the job stay.
    pub(crate) fn release(&self, job_id: Uuid, notify: &Arc<Notify>) {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = watches.get_mut(&job_id) {
            list.retain(|n| !Arc::ptr_eq(n, notify));
            if list.is_empty() {
                watches.remove(&job_id);
            }
        }
    }

    /// Wake every watch over `job_id`. Returns false when none is running.
    pub fn nudge(&self, job_id: Uuid) -> bool {
        let notifies = self
            .watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        for notify in &notifies {
            notify.notify_one();
        }
        !notifies.is_empty()
    }

    pub fn is_watching(&self, job_id: Uuid) -> bool {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&job_id)
    }

    /// Number of running watches.
    pub fn active(&self) -> usize {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nudge_reaches_registered_watch() {
        let registry = WatchRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.nudge(id));

        let notify = registry.register(id);
        assert!(registry.nudge(id));
        // The permit is stored until someone waits.
        tokio::time::timeout(std::time::Duration::from_millis(50), notify.notified())
            .await
            .unwrap();

        registry.release(id, &notify);
        assert!(!registry.is_watching(id));
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn releasing_one_watch_keeps_the_other() {
        let registry = WatchRegistry::new();
        let id = Uuid::new_v4();
        let first = registry.register(id);
        let second = registry.register(id);
        assert_eq!(registry.active(), 2);

        registry.release(id, &first);
        assert!(registry.is_watching(id));
        assert!(registry.nudge(id));
        tokio::time::timeout(std::time::Duration::from_millis(50), second.notified())
            .await
            .unwrap();

        registry.release(id, &second);
        assert!(!registry.is_watching(id));
    }
}
