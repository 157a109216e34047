use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Trigger;

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub task_id: i64,
    pub connection_id: i64,
    pub trigger: Trigger,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    /// Present iff `status` is terminal.
    pub end_time: Option<DateTime<Utc>>,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub files_deleted: u64,
    pub error_count: u64,
    /// Only ever set for failed or cancelled jobs.
    pub error_message: Option<String>,
}

impl Job {
    pub fn stats(&self) -> JobStats {
        JobStats {
            files_transferred: self.files_transferred,
            bytes_transferred: self.bytes_transferred,
            files_deleted: self.files_deleted,
            error_count: self.error_count,
        }
    }

    pub fn apply_stats(&mut self, stats: JobStats) {
        self.files_transferred = stats.files_transferred;
        self.bytes_transferred = stats.bytes_transferred;
        self.files_deleted = stats.files_deleted;
        self.error_count = stats.error_count;
    }
}

/// What the orchestrator hands the store when a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub task_id: i64,
    pub connection_id: i64,
    pub trigger: Trigger,
}

/// Aggregate counters persisted on the job record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStats {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub files_deleted: u64,
    pub error_count: u64,
}

impl JobStats {
    pub fn is_empty(&self) -> bool {
        *self == JobStats::default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}
