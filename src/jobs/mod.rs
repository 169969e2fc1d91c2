//! Shared job contract types.
//!
//! Both the orchestration core and concrete workers import these, so this
//! module depends on nothing else in the crate except error types.

pub mod definition;
pub mod model;
pub mod work;

pub use definition::{
    ErrorStrategy, ErrorTolerance, FailureAction, JobDefinition, JobStep, StepType,
};
pub use model::{
    ChildJobStats, Job, JobStatus, JobType, JsonMap, ReportKind, StatusReport, keys, merge_patch,
};
pub use work::{ProcessingStrategy, WorkItem, WorkerInitResult};
