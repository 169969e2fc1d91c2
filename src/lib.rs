//! Ingest Orchestrator: hierarchical job orchestration.
//!
//! A manager job runs a definition's steps; each step fans out into
//! worker jobs. Monitors resolve parents from their children, the event
//! bus carries progress, and the scheduler runs definitions on cron.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fault;
pub mod jobs;
pub mod monitor;
pub mod scheduler;
pub mod state;
pub mod store;

pub use error::{Error, Result};
