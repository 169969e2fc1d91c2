//! libSQL backend: durable `Database` implementation.
//!
//! Concurrency-sensitive writes are single statements: status writes are
//! compare-and-set against terminal values, metadata merges use
//! `json_patch`, and the document counter increments inside one `UPDATE`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{ChildJobStats, Job, JobStatus, JsonMap, ReportKind};
use crate::store::migrations;
use crate::store::traits::{Database, JobFilter, JobLogEntry, LogLevel, StatusWrite};

/// libSQL database backend.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("current_status: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("current_status row: {e}")))?;
                Ok(Some(status.parse().map_err(DatabaseError::Serialization)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("current_status: {e}"))),
        }
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row in {op}: {e}"),
            }
        }
        Ok(jobs)
    }

    fn require_row(id: Uuid, affected: u64) -> Result<(), DatabaseError> {
        if affected == 0 {
            Err(DatabaseError::job_not_found(id))
        } else {
            Ok(())
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 so text ordering is time ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_map(s: &str) -> JsonMap {
    serde_json::from_str(s).unwrap_or_default()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn to_json(map: &JsonMap) -> Result<String, DatabaseError> {
    serde_json::to_string(map).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const JOB_COLUMNS: &str = "id, job_type, parent_id, manager_id, name, config, metadata, status, \
     error, depth, created_at, started_at, finished_at, last_heartbeat";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("job row: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let job_type: String = row.get(1).map_err(get_err)?;
    let parent_id: Option<String> = row.get(2).ok();
    let manager_id: Option<String> = row.get(3).ok();
    let config: String = row.get(5).unwrap_or_else(|_| "{}".to_string());
    let metadata: String = row.get(6).unwrap_or_else(|_| "{}".to_string());
    let status: String = row.get(7).map_err(get_err)?;
    let created_at: String = row.get(10).map_err(get_err)?;

    Ok(Job {
        id: parse_uuid(&id)?,
        job_type: job_type.parse().map_err(DatabaseError::Serialization)?,
        parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
        manager_id: manager_id.as_deref().map(parse_uuid).transpose()?,
        name: row.get(4).map_err(get_err)?,
        config: parse_map(&config),
        metadata: parse_map(&metadata),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        error: row.get(8).ok(),
        depth: row.get::<i64>(9).unwrap_or(0) as u32,
        created_at: parse_datetime(&created_at),
        started_at: parse_optional_datetime(row.get(11).ok()),
        finished_at: parse_optional_datetime(row.get(12).ok()),
        last_heartbeat: parse_optional_datetime(row.get(13).ok()),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlStore {
    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    opt_uuid(job.parent_id),
                    opt_uuid(job.manager_id),
                    job.name.clone(),
                    to_json(&job.config)?,
                    to_json(&job.metadata)?,
                    job.status.as_str(),
                    opt_text(job.error.as_deref()),
                    job.depth as i64,
                    ts(job.created_at),
                    opt_text(job.started_at.map(ts).as_deref()),
                    opt_text(job.finished_at.map(ts).as_deref()),
                    opt_text(job.last_heartbeat.map(ts).as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        debug!(job_id = %job.id, job_type = %job.job_type, "Job record created");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<StatusWrite, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?2, error = COALESCE(?3, error), \
                 started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?4 ELSE started_at END \
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![id.to_string(), status.as_str(), opt_text(error), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_status: {e}")))?;

        if affected > 0 {
            return Ok(StatusWrite::Applied);
        }
        match self.current_status(id).await? {
            Some(current) => Ok(StatusWrite::Rejected { current }),
            None => Err(DatabaseError::job_not_found(id)),
        }
    }

    async fn update_job_metadata(&self, id: Uuid, patch: &JsonMap) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET metadata = json_patch(metadata, ?2) WHERE id = ?1",
                params![id.to_string(), to_json(patch)?],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_metadata: {e}")))?;
        Self::require_row(id, affected)
    }

    async fn append_status_report(
        &self,
        id: Uuid,
        kind: ReportKind,
        message: &str,
    ) -> Result<(), DatabaseError> {
        let path = format!("$.status_report.{}", kind.field());
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET metadata = json_set( \
                     json_set(metadata, '$.status_report', \
                         json(COALESCE(json_extract(metadata, '$.status_report'), '{}'))), \
                     ?2, \
                     json_insert(COALESCE(json_extract(metadata, ?2), '[]'), '$[#]', ?3)) \
                 WHERE id = ?1",
                params![id.to_string(), path, message],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_status_report: {e}")))?;
        Self::require_row(id, affected)
    }

    async fn increment_document_count(&self, id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET metadata = json_set(metadata, '$.document_count', \
                     COALESCE(json_extract(metadata, '$.document_count'), 0) + 1) \
                 WHERE id = ?1 \
                 RETURNING json_extract(metadata, '$.document_count')",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_document_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Err(DatabaseError::job_not_found(id)),
            Err(e) => Err(DatabaseError::Query(format!("increment_document_count: {e}"))),
        }
    }

    async fn set_finished(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET finished_at = ?2 WHERE id = ?1 AND finished_at IS NULL",
                params![id.to_string(), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_finished: {e}")))?;
        if affected > 0 {
            return Ok(true);
        }
        match self.current_status(id).await? {
            Some(_) => Ok(false),
            None => Err(DatabaseError::job_not_found(id)),
        }
    }

    async fn touch_heartbeat(&self, id: Uuid) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET last_heartbeat = ?2 WHERE id = ?1",
                params![id.to_string(), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_heartbeat: {e}")))?;
        Self::require_row(id, affected)
    }

    async fn get_child_stats(
        &self,
        parent_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ChildJobStats>, DatabaseError> {
        let mut stats: HashMap<Uuid, ChildJobStats> = parent_ids
            .iter()
            .map(|id| (*id, ChildJobStats::default()))
            .collect();
        if parent_ids.is_empty() {
            return Ok(stats);
        }

        let ids: Vec<String> = parent_ids.iter().map(Uuid::to_string).collect();
        let ids_json = serde_json::to_string(&ids)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let mut rows = self
            .conn()
            .query(
                "SELECT parent_id, status, COUNT(*) FROM jobs \
                 WHERE parent_id IN (SELECT value FROM json_each(?1)) \
                 GROUP BY parent_id, status",
                params![ids_json],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_child_stats: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let parent: String = row.get(0).unwrap_or_default();
            let status: String = row.get(1).unwrap_or_default();
            let count = row.get::<i64>(2).unwrap_or(0).max(0) as usize;
            let (Ok(parent), Ok(status)) = (Uuid::parse_str(&parent), status.parse::<JobStatus>())
            else {
                continue;
            };
            if let Some(entry) = stats.get_mut(&parent) {
                for _ in 0..count {
                    entry.record(status);
                }
            }
        }
        Ok(stats)
    }

    async fn list_child_jobs(&self, parent_id: Uuid) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "list_child_jobs",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = ?1 ORDER BY created_at ASC"),
            params![parent_id.to_string()],
        )
        .await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        self.query_jobs(
            "list_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE (?1 IS NULL OR parent_id = ?1) \
                   AND (?2 IS NULL OR status = ?2) \
                   AND (?3 IS NULL OR job_type = ?3) \
                 ORDER BY created_at DESC LIMIT ?4"
            ),
            params![
                opt_uuid(filter.parent_id),
                opt_text(filter.status.map(|s| s.as_str())),
                opt_text(filter.job_type.map(|t| t.as_str())),
                limit,
            ],
        )
        .await
    }

    async fn get_stale_jobs(&self, threshold_minutes: i64) -> Result<Vec<Job>, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(threshold_minutes);
        self.query_jobs(
            "get_stale_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' \
                 AND COALESCE(last_heartbeat, started_at, created_at) < ?1"
            ),
            params![ts(cutoff)],
        )
        .await
    }

    async fn mark_running_jobs_as_pending(&self, reason: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET status = 'pending' WHERE status = 'running' RETURNING id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_running_jobs_as_pending: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                ids.push(id);
            }
        }
        drop(rows);

        let now = ts(Utc::now());
        for id in &ids {
            self.conn()
                .execute(
                    "INSERT INTO job_logs (job_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id.clone(), LogLevel::Warn.as_str(), reason, now.clone()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("mark_running_jobs_as_pending log: {e}")))?;
        }

        if !ids.is_empty() {
            info!(count = ids.len(), reason, "Requeued running jobs");
        }
        Ok(ids.len())
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;
        Self::require_row(id, affected)?;

        self.conn()
            .execute("DELETE FROM job_logs WHERE job_id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job logs: {e}")))?;
        Ok(())
    }

    // ── Job logs ────────────────────────────────────────────────────

    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO job_logs (job_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.job_id.to_string(),
                    entry.level.as_str(),
                    entry.message.clone(),
                    ts(entry.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_job_log: {e}")))?;
        Ok(())
    }

    async fn get_job_logs(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<JobLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT level, message, created_at FROM job_logs \
                 WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
                params![job_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_logs: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let level: String = row.get(0).unwrap_or_default();
            let created_at: String = row.get(2).unwrap_or_default();
            entries.push(JobLogEntry {
                job_id,
                level: LogLevel::parse(&level),
                message: row.get(1).unwrap_or_default(),
                timestamp: parse_datetime(&created_at),
            });
        }
        entries.reverse();
        Ok(entries)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_setting: {e}")))?;
        Ok(())
    }

    async fn list_settings(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT key, value FROM settings WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                params![prefix],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_settings: {e}")))?;

        let mut settings = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let (Ok(key), Ok(value)) = (row.get::<String>(0), row.get::<String>(1)) {
                settings.push((key, value));
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_db() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    async fn seeded(db: &LibSqlStore) -> (Job, Job) {
        let manager = Job::manager("daily crawl");
        let step = Job::step(&manager, "fetch");
        db.create_job(&manager).await.unwrap();
        db.create_job(&step).await.unwrap();
        (manager, step)
    }

    #[tokio::test]
    async fn job_round_trips_through_table() {
        let db = test_db().await;
        let (manager, step) = seeded(&db).await;

        let loaded = db.get_job(step.id).await.unwrap().unwrap();
        assert_eq!(loaded.parent_id, Some(manager.id));
        assert_eq!(loaded.manager_id, Some(manager.id));
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.metadata_uuid("manager_id"), Some(manager.id));
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_write_is_compare_and_set() {
        let db = test_db().await;
        let (manager, _) = seeded(&db).await;

        let write = db
            .update_job_status(manager.id, JobStatus::Running, None)
            .await
            .unwrap();
        assert!(write.is_applied());
        let running = db.get_job(manager.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());

        db.update_job_status(manager.id, JobStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let write = db
            .update_job_status(manager.id, JobStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(
            write,
            StatusWrite::Rejected {
                current: JobStatus::Failed
            }
        );
        let job = db.get_job(manager.id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn metadata_patch_merges_nested_objects() {
        let db = test_db().await;
        let (manager, _) = seeded(&db).await;
        let first = json!({"step_statuses": {"a": "running"}, "total_steps": 2});
        let second = json!({"step_statuses": {"b": "completed"}});
        db.update_job_metadata(manager.id, first.as_object().unwrap())
            .await
            .unwrap();
        db.update_job_metadata(manager.id, second.as_object().unwrap())
            .await
            .unwrap();

        let job = db.get_job(manager.id).await.unwrap().unwrap();
        assert_eq!(job.metadata["total_steps"], json!(2));
        assert_eq!(
            job.metadata["step_statuses"],
            json!({"a": "running", "b": "completed"})
        );
    }

    #[tokio::test]
    async fn document_count_increments_in_place() {
        let db = test_db().await;
        let (manager, _) = seeded(&db).await;
        for expected in 1..=3 {
            assert_eq!(db.increment_document_count(manager.id).await.unwrap(), expected);
        }
        assert_eq!(
            db.get_job(manager.id).await.unwrap().unwrap().document_count(),
            3
        );
        assert!(db.increment_document_count(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn status_report_append_creates_lists() {
        let db = test_db().await;
        let (manager, _) = seeded(&db).await;
        db.append_status_report(manager.id, ReportKind::Error, "one")
            .await
            .unwrap();
        db.append_status_report(manager.id, ReportKind::Error, "two")
            .await
            .unwrap();
        db.append_status_report(manager.id, ReportKind::Warning, "careful")
            .await
            .unwrap();
        let report = db.get_job(manager.id).await.unwrap().unwrap().status_report();
        assert_eq!(report.errors, vec!["one", "two"]);
        assert_eq!(report.warnings, vec!["careful"]);
    }

    #[tokio::test]
    async fn child_stats_grouped_per_parent() {
        let db = test_db().await;
        let (manager, step) = seeded(&db).await;
        for status in [JobStatus::Completed, JobStatus::Completed, JobStatus::Failed] {
            let mut worker = Job::worker(&step, "w");
            worker.status = status;
            db.create_job(&worker).await.unwrap();
        }
        let stats = db.get_child_stats(&[manager.id, step.id]).await.unwrap();
        assert_eq!(stats[&manager.id].pending, 1);
        assert_eq!(stats[&step.id].completed, 2);
        assert_eq!(stats[&step.id].failed, 1);
        assert!(stats[&step.id].is_settled());
    }

    #[tokio::test]
    async fn set_finished_only_once() {
        let db = test_db().await;
        let (manager, _) = seeded(&db).await;
        assert!(db.set_finished(manager.id).await.unwrap());
        assert!(!db.set_finished(manager.id).await.unwrap());
        assert!(db.set_finished(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn stale_jobs_use_heartbeat_age() {
        let db = test_db().await;
        let (manager, step) = seeded(&db).await;
        let mut old = Job::worker(&step, "stuck");
        old.status = JobStatus::Running;
        old.created_at = Utc::now() - chrono::Duration::minutes(30);
        old.started_at = Some(old.created_at);
        db.create_job(&old).await.unwrap();
        db.update_job_status(manager.id, JobStatus::Running, None)
            .await
            .unwrap();
        db.touch_heartbeat(manager.id).await.unwrap();

        let stale = db.get_stale_jobs(10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[tokio::test]
    async fn logs_and_settings_persist() {
        let db = test_db().await;
        let (manager, _) = seeded(&db).await;
        for i in 0..5 {
            db.append_job_log(&JobLogEntry::new(manager.id, LogLevel::Info, format!("line {i}")))
                .await
                .unwrap();
        }
        let tail = db.get_job_logs(manager.id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "line 3");
        assert_eq!(tail[1].message, "line 4");

        db.set_setting("job_settings:news", "{}").await.unwrap();
        db.set_setting("job_settings:news", "{\"enabled\":false}").await.unwrap();
        db.set_setting("base_url", "https://example.org").await.unwrap();
        let listed = db.list_settings("job_settings:").await.unwrap();
        assert_eq!(listed, vec![("job_settings:news".to_string(), "{\"enabled\":false}".to_string())]);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let id = {
            let db = LibSqlStore::new_local(&path).await.unwrap();
            let manager = Job::manager("persisted");
            db.create_job(&manager).await.unwrap();
            manager.id
        };
        let db = LibSqlStore::new_local(&path).await.unwrap();
        assert_eq!(db.get_job(id).await.unwrap().unwrap().name, "persisted");
    }

    #[tokio::test]
    async fn requeue_logs_reason() {
        let db = test_db().await;
        let (manager, _) = seeded(&db).await;
        db.update_job_status(manager.id, JobStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(db.mark_running_jobs_as_pending("restart").await.unwrap(), 1);
        let job = db.get_job(manager.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let logs = db.get_job_logs(manager.id, 10).await.unwrap();
        assert_eq!(logs[0].level, LogLevel::Warn);
    }
}
