use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// A configured sync definition: where files come from, where they go.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescriptor {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    /// Local side of the sync.
    pub source_path: String,
    pub connection_id: i64,
    /// Remote name the destination handle is opened (and cached) under.
    pub connection_name: String,
    pub remote_path: String,
    pub direction: Direction,
    /// Rules of the form `+ pattern` / `- pattern`, first match wins.
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub options: TaskOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskOptions {
    pub no_delete: bool,
    pub transfers: Option<usize>,
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
    Bidirectional,
}

/// Which side wins when both copies of a file changed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Newer,
    Older,
    Larger,
    Smaller,
    Path1,
    Path2,
}

/// Why a job was started.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Schedule,
    Realtime,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Schedule => "schedule",
            Trigger::Realtime => "realtime",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "schedule" => Ok(Trigger::Schedule),
            "realtime" => Ok(Trigger::Realtime),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}
