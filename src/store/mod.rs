//! Persistence layer: job records, job logs, and key/value settings.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{
    CascadeFailure, CascadeReport, Database, JobFilter, JobLogEntry, LogLevel, MAX_CASCADE_DEPTH,
    StatusWrite,
};
