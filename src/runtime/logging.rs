use super::StatePaths;
use crate::shared::now_rfc3339;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Best-effort JSON-lines log for engine and sandbox events. Write failures
/// are swallowed so logging never fails a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLog {
    path: Option<PathBuf>,
}

impl RuntimeLog {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            path: Some(paths.runtime_log_path()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn info(&self, event: &str, message: &str) {
        self.append("info", event, message);
    }

    pub fn warn(&self, event: &str, message: &str) {
        self.append("warn", event, message);
    }

    pub fn error(&self, event: &str, message: &str) {
        self.append("error", event, message);
    }

    pub fn append(&self, level: &str, event: &str, message: &str) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let payload = serde_json::json!({
            "timestamp": now_rfc3339(),
            "level": level,
            "event": event,
            "message": message,
        });

        let Ok(line) = serde_json::to_string(&payload) else {
            return;
        };

        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}
