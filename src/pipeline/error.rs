use super::Stage;
use crate::registry::RegistryError;

/// Why a stage did not advance. The display text becomes the task's
/// `"Error: ..."` status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),
    #[error("script failed ({failure}): {detail}")]
    Script { failure: String, detail: String },
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: Stage, to: Stage },
    #[error("stage handler panicked: {0}")]
    Panicked(String),
    #[error("invalid review feedback: {0}")]
    InvalidFeedback(String),
    #[error(transparent)]
    Gate(#[from] crate::gate::GateError),
    #[error("io error at {path}: {message}")]
    Io { path: String, message: String },
}

impl StageError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown task `{task_id}`")]
    UnknownTask { task_id: String },
    #[error("task `{task_id}` already has a running worker")]
    WorkerActive { task_id: String },
    #[error("task `{task_id}` is at stage {stage}; continue requires idle")]
    NotIdle { task_id: String, stage: Stage },
    #[error("invalid review feedback `{feedback}`: expected `yes` or `no <details>`")]
    InvalidFeedback { feedback: String },
    #[error("task `{task_id}` reviews with `yes` or `no <details>`, not a bare approval")]
    ReviewRequiresFeedback { task_id: String },
    #[error("invalid file name `{name}`: expected a file directly inside the task directory")]
    InvalidFileName { name: String },
    #[error("file `{name}` not found for task `{task_id}`")]
    TaskFileNotFound { task_id: String, name: String },
    #[error("failed to read {path}: {source}")]
    TaskFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to allocate task id: {0}")]
    TaskId(String),
    #[error("failed to create working directory {path}: {source}")]
    WorkingDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn worker for task `{task_id}`: {source}")]
    Spawn {
        task_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl PipelineError {
    pub(crate) fn from_registry(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { task_id } => PipelineError::UnknownTask { task_id },
            other => PipelineError::Registry(other),
        }
    }
}
