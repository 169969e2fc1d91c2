//! Error types for the orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn job_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        }
    }
}

/// Malformed input rejected before any side effect.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Job {id} has invalid shape: {reason}")]
    JobShape { id: Uuid, reason: String },

    #[error("Job definition {name} is invalid: {reason}")]
    Definition { name: String, reason: String },

    #[error("Step {step} has invalid config: {reason}")]
    StepConfig { step: String, reason: String },

    #[error("Invalid cron schedule '{expression}': {reason}")]
    Schedule { expression: String, reason: String },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {status}, cannot stamp finished before a terminal status")]
    NotTerminal { id: Uuid, status: String },

    #[error("Job {id} timed out after {waited:?}")]
    Timeout { id: Uuid, waited: Duration },

    #[error("Job {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Recovered fault in {component} for job {id}: {message}")]
    RecoveredFault {
        component: String,
        id: Uuid,
        message: String,
    },

    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Job {id} exceeded failure tolerance: {failed} failed children (max {max})")]
    ToleranceExceeded { id: Uuid, failed: usize, max: usize },
}

/// Event bus errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event bus is closed")]
    Closed,

    #[error("Handler for {event_type} failed: {message}")]
    HandlerFailed { event_type: String, message: String },

    #[error("{} handler(s) failed for {event_type}: {}", .errors.len(), .errors.join("; "))]
    Aggregate {
        event_type: String,
        errors: Vec<String>,
    },
}

/// Worker dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("No worker registered for step type {step_type}")]
    NotRegistered { step_type: String },

    #[error("Worker {step_type} init failed: {reason}")]
    Init { step_type: String, reason: String },

    #[error("Worker {step_type} failed to create jobs: {reason}")]
    CreateJobs { step_type: String, reason: String },
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduled job {0} not found")]
    NotFound(String),

    #[error("Scheduled job {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Scheduled job {0} is already executing")]
    AlreadyExecuting(String),

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Scheduled task failed: {0}")]
    TaskFailed(String),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
