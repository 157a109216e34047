use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use surrealdb::types::SurrealValue;
use thiserror::Error;
use ulid::Ulid;

use crate::{
    db::DbHandle,
    models::{Job, JobStats, JobStatus, LogEntry, NewJob},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    DbError(String),
}

/// Persistence for job records and their logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Sets `end_time` to `at` when `status` is terminal and clears it otherwise.
    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update_job_stats(&self, job_id: &str, stats: JobStats) -> Result<(), StoreError>;

    async fn append_logs_batch(&self, job_id: &str, logs: &[LogEntry]) -> Result<(), StoreError>;

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Every job recorded for a task, oldest first.
    async fn list_jobs(&self, task_id: i64) -> Result<Vec<Job>, StoreError>;

    async fn list_logs(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError>;
}

/// [`JobStore`] backed by the embedded SurrealDB.
#[derive(Clone)]
pub struct SurrealJobStore {
    db: DbHandle,
    seq: std::sync::Arc<AtomicI64>,
}

impl SurrealJobStore {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            seq: std::sync::Arc::new(AtomicI64::new(0)),
        }
    }
}

#[derive(Debug, Clone, SurrealValue)]
struct JobRow {
    key: String,
    task_id: i64,
    connection_id: i64,
    trigger: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    files_transferred: i64,
    bytes_transferred: i64,
    files_deleted: i64,
    error_count: i64,
    error_message: Option<String>,
}

#[derive(Debug, Clone, SurrealValue)]
struct LogRow {
    #[allow(dead_code)]
    seq: i64,
    level: String,
    action: String,
    path: String,
    size: i64,
    timestamp: String,
    message: String,
}

fn db_err(e: surrealdb::Error) -> StoreError {
    StoreError::DbError(e.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            id: self.key,
            task_id: self.task_id,
            connection_id: self.connection_id,
            trigger: self.trigger.parse().map_err(StoreError::Corrupt)?,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            files_transferred: self.files_transferred.max(0) as u64,
            bytes_transferred: self.bytes_transferred.max(0) as u64,
            files_deleted: self.files_deleted.max(0) as u64,
            error_count: self.error_count.max(0) as u64,
            error_message: self.error_message,
        })
    }
}

impl LogRow {
    fn into_entry(self) -> Result<LogEntry, StoreError> {
        Ok(LogEntry {
            level: self.level.parse().map_err(StoreError::Corrupt)?,
            action: self.action.parse().map_err(StoreError::Corrupt)?,
            path: self.path,
            size: self.size.max(0) as u64,
            timestamp: parse_time(&self.timestamp)?,
            message: Some(self.message).filter(|m| !m.is_empty()),
        })
    }
}

#[async_trait]
impl JobStore for SurrealJobStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let id = Ulid::new().to_string();
        // Stored with microsecond precision.
        let start_time = Utc::now().trunc_subsecs(6);

        self.db
            .db
            .query(
                "CREATE type::record('job', $key) CONTENT {
                    task_id: $task_id,
                    connection_id: $connection_id,
                    trigger: $trigger,
                    status: 'pending',
                    start_time: $start_time,
                    end_time: NONE,
                    files_transferred: 0,
                    bytes_transferred: 0,
                    files_deleted: 0,
                    error_count: 0,
                    error_message: NONE,
                }",
            )
            .bind(("key", id.clone()))
            .bind(("task_id", new.task_id))
            .bind(("connection_id", new.connection_id))
            .bind(("trigger", new.trigger.as_str().to_string()))
            .bind(("start_time", timestamp(start_time)))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;

        Ok(Job {
            id,
            task_id: new.task_id,
            connection_id: new.connection_id,
            trigger: new.trigger,
            status: JobStatus::Pending,
            start_time,
            end_time: None,
            files_transferred: 0,
            bytes_transferred: 0,
            files_deleted: 0,
            error_count: 0,
            error_message: None,
        })
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let end_time = if status.is_terminal() { "$end_time" } else { "NONE" };
        let keeps_error = matches!(status, JobStatus::Failed | JobStatus::Cancelled);
        let error = match error_message {
            Some(_) if keeps_error => "$error",
            _ => "NONE",
        };

        let mut response = self
            .db
            .db
            .query(format!(
                "UPDATE type::record('job', $key) SET
                    status = $status,
                    end_time = {end_time},
                    error_message = {error}
                RETURN VALUE status"
            ))
            .bind(("key", job_id.to_string()))
            .bind(("status", status.as_str().to_string()))
            .bind(("end_time", timestamp(at)))
            .bind(("error", error_message.unwrap_or_default().to_string()))
            .await
            .map_err(db_err)?;

        let updated: Vec<String> = response.take(0).map_err(db_err)?;
        if updated.is_empty() {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn update_job_stats(&self, job_id: &str, stats: JobStats) -> Result<(), StoreError> {
        self.db
            .db
            .query(
                "UPDATE type::record('job', $key) SET
                    files_transferred = $files_transferred,
                    bytes_transferred = $bytes_transferred,
                    files_deleted = $files_deleted,
                    error_count = $error_count",
            )
            .bind(("key", job_id.to_string()))
            .bind(("files_transferred", stats.files_transferred as i64))
            .bind(("bytes_transferred", stats.bytes_transferred as i64))
            .bind(("files_deleted", stats.files_deleted as i64))
            .bind(("error_count", stats.error_count as i64))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    async fn append_logs_batch(&self, job_id: &str, logs: &[LogEntry]) -> Result<(), StoreError> {
        for entry in logs {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            self.db
                .db
                .query(
                    "CREATE job_log CONTENT {
                        job: $job,
                        seq: $seq,
                        level: $level,
                        action: $action,
                        path: $path,
                        size: $size,
                        timestamp: $timestamp,
                        message: $message,
                    }",
                )
                .bind(("job", job_id.to_string()))
                .bind(("seq", seq))
                .bind(("level", entry.level.as_str().to_string()))
                .bind(("action", entry.action.as_str().to_string()))
                .bind(("path", entry.path.clone()))
                .bind(("size", entry.size as i64))
                .bind(("timestamp", timestamp(entry.timestamp)))
                .bind(("message", entry.message.clone().unwrap_or_default()))
                .await
                .map_err(db_err)?
                .check()
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        self.db
            .db
            .query(
                "DELETE type::record('job', $key);
                 DELETE job_log WHERE job = $key;",
            )
            .bind(("key", job_id.to_string()))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let mut response = self
            .db
            .db
            .query(
                "SELECT record::id(id) AS key, task_id, connection_id, trigger, status, start_time, end_time,
                    files_transferred, bytes_transferred, files_deleted, error_count, error_message
                 FROM type::record('job', $key)",
            )
            .bind(("key", job_id.to_string()))
            .await
            .map_err(db_err)?;

        let row: Option<JobRow> = response.take(0).map_err(db_err)?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_jobs(&self, task_id: i64) -> Result<Vec<Job>, StoreError> {
        let mut response = self
            .db
            .db
            .query(
                "SELECT record::id(id) AS key, task_id, connection_id, trigger, status, start_time, end_time,
                    files_transferred, bytes_transferred, files_deleted, error_count, error_message
                 FROM job WHERE task_id = $task_id ORDER BY start_time ASC",
            )
            .bind(("task_id", task_id))
            .await
            .map_err(db_err)?;

        let rows: Vec<JobRow> = response.take(0).map_err(db_err)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_logs(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let mut response = self
            .db
            .db
            .query(
                "SELECT level, action, path, size, timestamp, message, seq
                 FROM job_log WHERE job = $job ORDER BY seq ASC",
            )
            .bind(("job", job_id.to_string()))
            .await
            .map_err(db_err)?;

        let rows: Vec<LogRow> = response.take(0).map_err(db_err)?;
        rows.into_iter().map(LogRow::into_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogAction, LogLevel, Trigger};

    async fn store() -> SurrealJobStore {
        SurrealJobStore::new(crate::db::init_memory().await.unwrap())
    }

    fn new_job() -> NewJob {
        NewJob { task_id: 3, connection_id: 9, trigger: Trigger::Schedule }
    }

    #[tokio::test]
    async fn create_and_read_back() {
        let store = store().await;
        let job = store.create_job(new_job()).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.task_id, 3);
        assert_eq!(loaded.trigger, Trigger::Schedule);
        assert_eq!(loaded.start_time, job.start_time);
        assert_eq!(loaded.end_time, None);
    }

    #[tokio::test]
    async fn end_time_follows_terminal_status() {
        let store = store().await;
        let job = store.create_job(new_job()).await.unwrap();

        store.update_job_status(&job.id, JobStatus::Running, None, Utc::now()).await.unwrap();
        let running = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.end_time.is_none());

        let ended = Utc::now().trunc_subsecs(6);
        store.update_job_status(&job.id, JobStatus::Failed, Some("boom"), ended).await.unwrap();
        let failed = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.end_time, Some(ended));
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn success_never_keeps_an_error_message() {
        let store = store().await;
        let job = store.create_job(new_job()).await.unwrap();

        store.update_job_status(&job.id, JobStatus::Success, Some("ignored"), Utc::now()).await.unwrap();
        let done = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.error_message, None);
    }

    #[tokio::test]
    async fn updating_unknown_job_fails() {
        let store = store().await;
        let err = store.update_job_status("nope", JobStatus::Running, None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn stats_and_logs_persist() {
        let store = store().await;
        let job = store.create_job(new_job()).await.unwrap();

        let stats = JobStats { files_transferred: 2, bytes_transferred: 30, files_deleted: 1, error_count: 0 };
        store.update_job_stats(&job.id, stats).await.unwrap();
        store
            .append_logs_batch(
                &job.id,
                &[
                    LogEntry::new(LogLevel::Info, LogAction::Upload, "a.txt", 10),
                    LogEntry::new(LogLevel::Info, LogAction::Upload, "b.txt", 20).with_message("retried"),
                ],
            )
            .await
            .unwrap();
        store
            .append_logs_batch(&job.id, &[LogEntry::new(LogLevel::Info, LogAction::Delete, "c.txt", 0)])
            .await
            .unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.stats(), stats);

        let logs = store.list_logs(&job.id).await.unwrap();
        let paths: Vec<&str> = logs.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(logs[2].action, LogAction::Delete);
        assert_eq!(logs[0].message, None);
        assert_eq!(logs[1].message.as_deref(), Some("retried"));
    }

    #[tokio::test]
    async fn delete_removes_job_and_logs() {
        let store = store().await;
        let job = store.create_job(new_job()).await.unwrap();
        store
            .append_logs_batch(&job.id, &[LogEntry::new(LogLevel::Error, LogAction::Error, "x", 0)])
            .await
            .unwrap();

        store.delete_job(&job.id).await.unwrap();

        assert!(store.get_job(&job.id).await.unwrap().is_none());
        assert!(store.list_logs(&job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_are_listed_per_task() {
        let store = store().await;
        let first = store.create_job(new_job()).await.unwrap();
        let second = store.create_job(new_job()).await.unwrap();
        store
            .create_job(NewJob { task_id: 4, connection_id: 9, trigger: Trigger::Manual })
            .await
            .unwrap();

        let ids: Vec<String> = store.list_jobs(3).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(store.list_jobs(5).await.unwrap().is_empty());
    }
}
