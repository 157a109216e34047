use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of a job's transfer log. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub action: LogAction,
    pub path: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    /// Error text or other detail, if any.
    pub message: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, action: LogAction, path: impl Into<String>, size: u64) -> Self {
        Self {
            level,
            action,
            path: path.into(),
            size,
            timestamp: Utc::now(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Upload,
    Download,
    Delete,
    Move,
    Error,
    Unknown,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LogAction::Upload => "upload",
            LogAction::Download => "download",
            LogAction::Delete => "delete",
            LogAction::Move => "move",
            LogAction::Error => "error",
            LogAction::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl FromStr for LogAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(LogAction::Upload),
            "download" => Ok(LogAction::Download),
            "delete" => Ok(LogAction::Delete),
            "move" => Ok(LogAction::Move),
            "error" => Ok(LogAction::Error),
            "unknown" => Ok(LogAction::Unknown),
            other => Err(format!("unknown log action: {other}")),
        }
    }
}
