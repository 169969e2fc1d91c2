//! Turning discovered work items into worker jobs.

use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{Job, ProcessingStrategy, WorkerInitResult, keys};
use crate::state::StateManager;

/// Create one worker job per item under `step`, following the strategy.
///
/// Sequential items carry a `sequence` number so consumers can keep their
/// order. Inline results enqueue nothing: the worker already did the work.
pub async fn enqueue_work_items(
    state: &StateManager,
    step: &Job,
    init: &WorkerInitResult,
) -> Result<Vec<Uuid>> {
    if init.strategy == ProcessingStrategy::Inline {
        tracing::debug!(step_id = %step.id, "Inline strategy, nothing to enqueue");
        return Ok(Vec::new());
    }

    let mut ids = Vec::with_capacity(init.work_items.len());
    for (index, item) in init.work_items.iter().enumerate() {
        let mut job = Job::worker(step, item.name.as_str())
            .with_config(item.config.clone())
            .with_metadata(keys::WORK_ITEM_ID, item.id.as_str());
        if !item.item_type.is_empty() {
            job = job.with_metadata(keys::ITEM_TYPE, item.item_type.as_str());
        }
        if init.strategy == ProcessingStrategy::Sequential {
            job = job.with_metadata(keys::SEQUENCE, index);
        }
        state.create_job(&job).await?;
        ids.push(job.id);
    }

    tracing::info!(
        step_id = %step.id,
        count = ids.len(),
        strategy = %init.strategy,
        "Enqueued worker jobs"
    );
    Ok(ids)
}
