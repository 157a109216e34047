use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// Live job-level progress. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub task_id: i64,
    pub connection_id: i64,
    pub status: JobStatus,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub files_total: u64,
    pub bytes_total: u64,
    pub files_deleted: u64,
    pub error_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Per-file progress for everything currently moving, plus files that
/// completed since the last event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferProgressEvent {
    pub job_id: String,
    pub task_id: i64,
    pub connection_id: i64,
    pub transfers: Vec<TransferItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferItem {
    pub name: String,
    pub size: u64,
    pub bytes_so_far: u64,
}
