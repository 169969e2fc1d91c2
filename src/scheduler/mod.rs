//! Cron scheduling, orphan cleanup and stale-job detection.

pub mod recovery;
pub mod schedule;
pub mod service;

pub use recovery::{ExecutionTracker, ORPHAN_REASON, OrphanPolicy};
pub use schedule::CronSchedule;
pub use service::{JobScheduleStatus, ScheduledJob, SchedulerService};
