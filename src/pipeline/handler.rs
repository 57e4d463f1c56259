use super::{ReviewDecision, Stage, StageError};
use crate::registry::{LogRole, TaskRegistry};
use crate::sandbox::{ExecutionResult, ScriptSandbox};
use crate::shared::TaskId;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Write handle for one task's logs and artifacts.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    registry: Arc<TaskRegistry>,
    task_id: TaskId,
}

impl TaskLogger {
    pub fn new(registry: Arc<TaskRegistry>, task_id: TaskId) -> Self {
        Self { registry, task_id }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn log(&self, text: impl Into<String>) {
        self.registry
            .append_log(self.task_id.as_str(), LogRole::Assistant, text);
    }

    pub fn user(&self, text: impl Into<String>) {
        self.registry.append_log(self.task_id.as_str(), LogRole::User, text);
    }

    pub fn system(&self, text: impl Into<String>) {
        self.registry.append_system_log(self.task_id.as_str(), text);
    }

    pub fn artifact(&self, reference: impl Into<String>) {
        self.registry
            .register_artifact(self.task_id.as_str(), reference);
    }
}

/// Everything a stage handler may touch while it runs.
pub struct StageContext<'a> {
    pub task_id: &'a TaskId,
    pub stage: Stage,
    pub context: &'a Map<String, Value>,
    pub working_dir: &'a Path,
    pub logger: &'a TaskLogger,
    pub sandbox: &'a ScriptSandbox,
    /// Feedback delivered through the review gate; only set for `user_review`.
    pub review_feedback: Option<&'a str>,
}

impl StageContext<'_> {
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.working_dir.join(file_name)
    }

    /// The stage a handler moves to when it has no opinion: the review
    /// decision for `user_review`, otherwise the single successor.
    pub fn default_next(&self) -> Result<Stage, StageError> {
        if self.stage == Stage::UserReview {
            let feedback = self.review_feedback.unwrap_or_default();
            let decision = ReviewDecision::parse(feedback).map_err(StageError::InvalidFeedback)?;
            return Ok(decision.next_stage());
        }
        match self.stage.successors() {
            [only] => Ok(*only),
            [] => Err(StageError::failed(format!(
                "stage {} has no successor",
                self.stage
            ))),
            _ => Err(StageError::failed(format!(
                "stage {} needs an explicit next stage",
                self.stage
            ))),
        }
    }

    /// Runs `source_text` in the task's working directory, mirroring every
    /// output line into the task's system logs and registering the files it
    /// produced.
    pub fn run_script(&self, source_text: &str) -> ExecutionResult {
        let logger = self.logger;
        let result = self.sandbox.run_with_output(
            source_text,
            self.working_dir,
            self.sandbox.config().timeout(),
            &mut |line| logger.system(format!("[{}] {}", line.stream, line.trimmed())),
        );
        for artifact in &result.artifacts {
            let reference = artifact
                .path
                .strip_prefix(self.working_dir)
                .unwrap_or(&artifact.path);
            logger.artifact(reference.display().to_string());
        }
        result
    }

    /// Like [`StageContext::run_script`], but a non-zero exit becomes a
    /// [`StageError::Script`] carrying the child's stderr.
    pub fn run_script_checked(&self, source_text: &str) -> Result<ExecutionResult, StageError> {
        let result = self.run_script(source_text);
        match result.failure() {
            None => Ok(result),
            Some(failure) => {
                let detail = if result.stderr.trim().is_empty() {
                    result.stdout.trim()
                } else {
                    result.stderr.trim()
                };
                Err(StageError::Script {
                    failure: failure.to_string(),
                    detail: detail.to_string(),
                })
            }
        }
    }
}

pub trait StageHandler: Send + Sync {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Stage, StageError>;
}

impl<F> StageHandler for F
where
    F: Fn(&mut StageContext<'_>) -> Result<Stage, StageError> + Send + Sync,
{
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Stage, StageError> {
        self(ctx)
    }
}

/// Pins a closure to the handler signature so it can be registered inline.
pub fn stage_fn<F>(handler: F) -> F
where
    F: Fn(&mut StageContext<'_>) -> Result<Stage, StageError> + Send + Sync,
{
    handler
}

#[derive(Default, Clone)]
pub struct HandlerSet {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, handler: impl StageHandler + 'static) -> &mut Self {
        self.handlers.insert(stage, Arc::new(handler));
        self
    }

    pub fn with(mut self, stage: Stage, handler: impl StageHandler + 'static) -> Self {
        self.register(stage, handler);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = self.handlers.keys().copied().collect::<Vec<_>>();
        stages.sort();
        stages
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("stages", &self.stages())
            .finish()
    }
}
