use crate::pipeline::Stage;
use crate::shared::TaskId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const INITIAL_STATUS: &str = "Starting...";
pub const ERROR_STATUS_PREFIX: &str = "Error: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRole {
    User,
    Assistant,
}

impl std::fmt::Display for LogRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogRole::User => write!(f, "user"),
            LogRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub role: LogRole,
    pub text: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemLogEntry {
    pub text: String,
    pub timestamp: String,
}

/// Snapshot of one pipeline run as observed by pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: String,
    pub stage: Stage,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub system_logs: Vec<SystemLogEntry>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub awaiting_approval: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(id: TaskId, context: Map<String, Value>, now: i64) -> Self {
        Self {
            id,
            status: INITIAL_STATUS.to_string(),
            stage: Stage::Start,
            logs: Vec::new(),
            system_logs: Vec::new(),
            artifacts: Vec::new(),
            context,
            awaiting_approval: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_errored(&self) -> bool {
        self.status.starts_with(ERROR_STATUS_PREFIX)
    }

    pub fn last_log(&self) -> Option<&LogEntry> {
        self.logs.last()
    }
}

pub fn error_status(reason: &str) -> String {
    format!("{ERROR_STATUS_PREFIX}{reason}")
}
