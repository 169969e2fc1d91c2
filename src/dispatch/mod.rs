//! Worker dispatch: routing step types to workers and running definitions.

pub mod enqueue;
pub mod orchestrator;
pub mod placeholders;
pub mod registry;
pub mod worker;

pub use enqueue::enqueue_work_items;
pub use orchestrator::Orchestrator;
pub use placeholders::resolve_placeholders;
pub use registry::WorkerRegistry;
pub use worker::{DispatchContext, Worker};
