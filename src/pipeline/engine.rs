use super::stage::gate_status_text;
use super::{HandlerSet, Stage, StageContext, StageError, TaskLogger};
use crate::gate::{ApprovalGates, REVIEW_GATE};
use crate::registry::{error_status, LogRole, TaskRegistry};
use crate::runtime::RuntimeLog;
use crate::sandbox::ScriptSandbox;
use crate::shared::TaskId;
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

pub const REVIEW_PROMPT: &str =
    "Please review the schema: type 'yes' to continue, or 'no' + corrections.";
pub const COMPLETED_MESSAGE: &str = "Pipeline completed successfully!";
pub const IDLE_MESSAGE: &str = "Processing finished. Confirm to generate and run the database scripts.";

/// Where a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached a terminal stage.
    Rested(Stage),
    Failed { stage: Stage, error: StageError },
}

/// Drives one task through its stages on the calling thread.
#[derive(Debug, Clone)]
pub struct PipelineStateMachine {
    registry: Arc<TaskRegistry>,
    gates: Arc<ApprovalGates>,
    sandbox: Arc<ScriptSandbox>,
    handlers: Arc<HandlerSet>,
    runtime_log: RuntimeLog,
}

impl PipelineStateMachine {
    pub fn new(
        registry: Arc<TaskRegistry>,
        gates: Arc<ApprovalGates>,
        sandbox: Arc<ScriptSandbox>,
        handlers: Arc<HandlerSet>,
    ) -> Self {
        Self {
            registry,
            gates,
            sandbox,
            handlers,
            runtime_log: RuntimeLog::disabled(),
        }
    }

    pub fn with_runtime_log(mut self, runtime_log: RuntimeLog) -> Self {
        self.runtime_log = runtime_log;
        self
    }

    /// Runs from `from` until a terminal stage or the first failure. Gate
    /// stages block this thread until their gate is fired.
    pub fn run(&self, task_id: &TaskId, from: Stage, working_dir: &Path) -> RunOutcome {
        let logger = TaskLogger::new(self.registry.clone(), task_id.clone());
        let context = self
            .registry
            .get(task_id.as_str())
            .map(|task| task.context)
            .unwrap_or_default();

        let mut stage = from;
        loop {
            self.registry.set_stage(task_id.as_str(), stage);
            if stage.gate().is_none() {
                self.registry
                    .set_status(task_id.as_str(), stage.status_text());
            }
            logger.system(format!("[engine] entering {stage}"));
            self.runtime_log.info(
                "stage.started",
                &format!("task_id={task_id} stage={stage}"),
            );

            if stage.is_terminal() {
                match stage {
                    Stage::Completed => logger.log(COMPLETED_MESSAGE),
                    _ => logger.log(IDLE_MESSAGE),
                }
                return RunOutcome::Rested(stage);
            }

            match self.step(task_id, stage, &context, working_dir, &logger) {
                Ok(next) => {
                    logger.log(format!("{stage} complete"));
                    self.runtime_log.info(
                        "stage.succeeded",
                        &format!("task_id={task_id} stage={stage} transition={next}"),
                    );
                    stage = next;
                }
                Err(error) => {
                    self.fail(task_id, stage, &error);
                    return RunOutcome::Failed { stage, error };
                }
            }
        }
    }

    fn step(
        &self,
        task_id: &TaskId,
        stage: Stage,
        context: &Map<String, Value>,
        working_dir: &Path,
        logger: &TaskLogger,
    ) -> Result<Stage, StageError> {
        let mut feedback = None;
        if let Some(gate) = stage.gate() {
            feedback = self.park(task_id, stage, gate, logger)?;
        }

        let mut ctx = StageContext {
            task_id,
            stage,
            context,
            working_dir,
            logger,
            sandbox: &self.sandbox,
            review_feedback: feedback.as_deref(),
        };
        let next = match self.handlers.get(stage) {
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler.run(&mut ctx))) {
                Ok(result) => result?,
                Err(payload) => return Err(StageError::Panicked(panic_message(payload.as_ref()))),
            },
            None => ctx.default_next()?,
        };

        if !stage.can_transition_to(next) {
            return Err(StageError::IllegalTransition {
                from: stage,
                to: next,
            });
        }
        Ok(next)
    }

    /// Opens the stage's gate and blocks until it is fired. Returns the
    /// feedback carried by the signal.
    fn park(
        &self,
        task_id: &TaskId,
        stage: Stage,
        gate: &str,
        logger: &TaskLogger,
    ) -> Result<Option<String>, StageError> {
        // `awaiting_approval` is published last: a poller that sees it can
        // always fire the gate and already sees the prompt.
        let handle = self.gates.open(task_id, gate);
        if gate == REVIEW_GATE {
            logger.log(REVIEW_PROMPT);
        } else {
            logger.log(format!("Waiting for approval to run the {gate} script."));
        }
        self.registry
            .set_status(task_id.as_str(), gate_status_text(gate));
        self.registry
            .set_awaiting_approval(task_id.as_str(), Some(gate));
        self.runtime_log.info(
            "gate.opened",
            &format!("task_id={task_id} stage={stage} gate={gate}"),
        );

        let signal = handle.wait();
        self.registry.set_awaiting_approval(task_id.as_str(), None);
        let signal = signal?;
        self.registry
            .set_status(task_id.as_str(), stage.status_text());
        self.runtime_log.info(
            "gate.fired",
            &format!("task_id={task_id} stage={stage} gate={gate}"),
        );
        Ok(signal.feedback)
    }

    fn fail(&self, task_id: &TaskId, stage: Stage, error: &StageError) {
        let reason = error.to_string();
        // Log first: a poller that sees the error status also sees why.
        self.registry.append_log(
            task_id.as_str(),
            LogRole::Assistant,
            format!("Error during {stage}: {reason}"),
        );
        self.registry
            .set_status(task_id.as_str(), error_status(&reason));
        self.runtime_log.error(
            "stage.failed",
            &format!("task_id={task_id} stage={stage} transition=failed reason={reason}"),
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic payload".to_string()
}
