//! Fault boundaries for detached tasks.
//!
//! A panic inside a monitor, event handler, or scheduled job body is caught
//! here, logged with a diagnostic dump, and returned as a value so only that
//! instance is lost.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use uuid::Uuid;

/// Diagnostic record for one recovered fault.
#[derive(Debug, Clone, Serialize)]
pub struct FaultReport {
    pub component: String,
    pub job_id: Option<Uuid>,
    pub message: String,
    pub backtrace: String,
    pub occurred_at: DateTime<Utc>,
}

impl FaultReport {
    pub fn new(component: &str, job_id: Option<Uuid>, message: String) -> Self {
        Self {
            component: component.to_string(),
            job_id,
            message,
            backtrace: Backtrace::force_capture().to_string(),
            occurred_at: Utc::now(),
        }
    }

    /// Log the dump and, when a directory is given, write it there as JSON.
    ///
    /// Returns the file written, if any. Write failures are logged only.
    pub fn record(&self, crash_dir: Option<&Path>) -> Option<PathBuf> {
        tracing::error!(
            component = %self.component,
            job_id = ?self.job_id,
            message = %self.message,
            backtrace = %self.backtrace,
            "Recovered fault"
        );

        let dir = crash_dir?;
        let file = dir.join(format!(
            "crash-{}-{}.json",
            self.occurred_at.format("%Y%m%dT%H%M%S%.3f"),
            self.job_id.map(|id| id.to_string()).unwrap_or_else(|| self.component.clone())
        ));
        let written = std::fs::create_dir_all(dir)
            .and_then(|_| {
                let body = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
                std::fs::write(&file, body)
            });
        match written {
            Ok(()) => Some(file),
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "Failed to write crash dump");
                None
            }
        }
    }
}

/// Best-effort text from a panic payload.
pub fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `fut`, turning a panic into a recorded `FaultReport`.
pub async fn guard<F, T>(
    component: &str,
    job_id: Option<Uuid>,
    crash_dir: Option<&Path>,
    fut: F,
) -> Result<T, FaultReport>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let report = FaultReport::new(component, job_id, panic_message(&payload));
            report.record(crash_dir);
            Err(report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_passes_values_through() {
        let out = guard("test", None, None, async { 7 }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn guard_converts_panic_into_report() {
        let job_id = Uuid::new_v4();
        let out: Result<(), _> = guard("monitor", Some(job_id), None, async {
            panic!("lost the plot");
        })
        .await;
        let report = out.unwrap_err();
        assert_eq!(report.message, "lost the plot");
        assert_eq!(report.job_id, Some(job_id));
    }

    #[tokio::test]
    async fn crash_dump_written_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out: Result<(), _> = guard("scheduler", None, Some(dir.path()), async {
            panic!("{}", String::from("formatted"));
        })
        .await;
        assert!(out.is_err());
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let body = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(body.contains("formatted"));
        assert!(body.contains("\"component\": \"scheduler\""));
    }
}
