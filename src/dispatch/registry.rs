//! Step type → worker routing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::dispatch::worker::Worker;
use crate::error::WorkerError;
use crate::jobs::StepType;

/// Registry of available workers.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<StepType, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker under its own type. Replaces any previous one.
    pub async fn register(&self, worker: Arc<dyn Worker>) {
        let step_type = worker.worker_type();
        if self
            .workers
            .write()
            .await
            .insert(step_type.clone(), worker)
            .is_some()
        {
            tracing::warn!(step_type = %step_type, "Replaced registered worker");
        } else {
            tracing::debug!("Registered worker: {}", step_type);
        }
    }

    pub async fn unregister(&self, step_type: &StepType) -> Option<Arc<dyn Worker>> {
        self.workers.write().await.remove(step_type)
    }

    pub async fn get(&self, step_type: &StepType) -> Option<Arc<dyn Worker>> {
        self.workers.read().await.get(step_type).cloned()
    }

    /// Like `get`, but a missing worker is an error.
    pub async fn resolve(&self, step_type: &StepType) -> Result<Arc<dyn Worker>, WorkerError> {
        self.get(step_type)
            .await
            .ok_or_else(|| WorkerError::NotRegistered {
                step_type: step_type.to_string(),
            })
    }

    pub async fn has(&self, step_type: &StepType) -> bool {
        self.workers.read().await.contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub async fn list(&self) -> Vec<StepType> {
        let mut types: Vec<StepType> = self.workers.read().await.keys().cloned().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    pub fn count(&self) -> usize {
        self.workers.try_read().map(|w| w.len()).unwrap_or(0)
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
