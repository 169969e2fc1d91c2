//! The contract every step worker implements.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::enqueue::enqueue_work_items;
use crate::error::{Result, ValidationError};
use crate::jobs::{JobDefinition, JobStep, StepType, WorkerInitResult};
use crate::state::StateManager;

/// Handles passed to `Worker::create_jobs`.
#[derive(Clone)]
pub struct DispatchContext {
    pub state: Arc<StateManager>,
    pub cancel: CancellationToken,
    /// Manager job the step belongs to.
    pub manager_id: Uuid,
}

impl DispatchContext {
    /// Enqueue the init result's items as worker jobs under `step_id`.
    pub async fn enqueue(&self, step_id: Uuid, init: &WorkerInitResult) -> Result<Vec<Uuid>> {
        let step = self.state.get_job(step_id).await?;
        enqueue_work_items(&self.state, &step, init).await
    }
}

/// A pluggable executor for one step type.
///
/// Dispatch calls `validate_config`, then `init`, then `create_jobs`.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Step type this worker handles.
    fn worker_type(&self) -> StepType;

    /// Reject a bad step config before anything is created.
    fn validate_config(&self, step: &JobStep) -> std::result::Result<(), ValidationError>;

    /// Discover work. Must not create jobs or mutate state.
    async fn init(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
    ) -> Result<WorkerInitResult>;

    /// Create or enqueue the step's work, returning the job id it ran under.
    ///
    /// Implementations call `init` themselves when `init` is `None`.
    async fn create_jobs(
        &self,
        ctx: &DispatchContext,
        step: &JobStep,
        definition: &JobDefinition,
        step_id: Uuid,
        init: Option<WorkerInitResult>,
    ) -> Result<Uuid>;

    /// Whether `create_jobs` leaves child jobs behind that need a step
    /// monitor.
    fn returns_child_jobs(&self) -> bool;
}
