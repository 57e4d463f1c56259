use super::{
    CleanupStage, CommandStage, HandlerSet, PipelineError, PipelineStateMachine, ReviewDecision,
    RunOutcome, ScriptFileStage, Stage,
};
use crate::config::{ScriptsConfig, Settings};
use crate::gate::{ApprovalGates, GateSignal, ParkedGate, CREATE_GATE, INSERT_GATE, REVIEW_GATE};
use crate::registry::{error_status, LogRole, RegistryError, Task, TaskRegistry};
use crate::runtime::{RuntimeLog, WorkerRegistry, WorkerState};
use crate::sandbox::ScriptSandbox;
use crate::shared::{now_secs, TaskId};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

const MAX_ID_ATTEMPTS: usize = 8;

/// Handlers for every stage that has work to do under `settings`. Configured
/// stage scripts replace the built-in behaviour of their stage.
pub fn handlers_from_settings(settings: &Settings) -> HandlerSet {
    let mut handlers = HandlerSet::new();
    handlers
        .register(
            Stage::ExecuteCreate,
            ScriptFileStage::new(settings.scripts.create_script_file.clone()),
        )
        .register(
            Stage::ExecuteInsert,
            ScriptFileStage::new(settings.scripts.insert_script_file.clone()),
        )
        .register(Stage::Cleanup, CleanupStage);
    for (stage, script) in &settings.stages {
        handlers.register(*stage, CommandStage::from_file(script.clone()));
    }
    handlers
}

/// Entry point for callers: starts tasks, reports their state and delivers
/// approvals to parked workers.
#[derive(Debug)]
pub struct PipelineService {
    registry: Arc<TaskRegistry>,
    gates: Arc<ApprovalGates>,
    machine: PipelineStateMachine,
    workers: Arc<Mutex<WorkerRegistry>>,
    workspaces_path: PathBuf,
    scripts: ScriptsConfig,
    runtime_log: RuntimeLog,
}

impl PipelineService {
    pub fn new(
        workspaces_path: impl Into<PathBuf>,
        sandbox: ScriptSandbox,
        handlers: HandlerSet,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let gates = Arc::new(ApprovalGates::new());
        let machine = PipelineStateMachine::new(
            registry.clone(),
            gates.clone(),
            Arc::new(sandbox),
            Arc::new(handlers),
        );
        Self {
            registry,
            gates,
            machine,
            workers: Arc::new(Mutex::new(WorkerRegistry::default())),
            workspaces_path: workspaces_path.into(),
            scripts: ScriptsConfig::default(),
            runtime_log: RuntimeLog::disabled(),
        }
    }

    pub fn from_settings(settings: &Settings, runtime_log: RuntimeLog) -> Self {
        let sandbox =
            ScriptSandbox::new(settings.sandbox.clone()).with_runtime_log(runtime_log.clone());
        Self::new(
            settings.workspaces_path.clone(),
            sandbox,
            handlers_from_settings(settings),
        )
        .with_scripts(settings.scripts.clone())
        .with_runtime_log(runtime_log)
    }

    pub fn with_scripts(mut self, scripts: ScriptsConfig) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_runtime_log(mut self, runtime_log: RuntimeLog) -> Self {
        self.machine = self.machine.with_runtime_log(runtime_log.clone());
        self.runtime_log = runtime_log;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn working_dir(&self, task_id: &str) -> PathBuf {
        self.workspaces_path.join(task_id)
    }

    pub fn start(&self, context: Map<String, Value>) -> Result<TaskId, PipelineError> {
        let task_id = self.create_task(context.clone())?;
        let working_dir = self.working_dir(task_id.as_str());
        if let Err(source) = fs::create_dir_all(&working_dir) {
            let path = working_dir.display().to_string();
            self.registry.set_status(
                task_id.as_str(),
                error_status(&format!("failed to create working directory {path}")),
            );
            return Err(PipelineError::WorkingDir { path, source });
        }

        self.registry.append_log(
            task_id.as_str(),
            LogRole::User,
            format!("User Context: {}", describe_context(&context)),
        );
        self.runtime_log.info(
            "task.started",
            &format!("task_id={task_id} working_dir={}", working_dir.display()),
        );
        self.spawn_worker(&task_id, Stage::Start, working_dir)?;
        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> Result<Task, PipelineError> {
        self.registry
            .get(task_id)
            .map_err(PipelineError::from_registry)
    }

    /// Fires `gate` for the task. `Ok(false)` means the task was not waiting
    /// on that gate; the attempt is still recorded in the task log. The review
    /// gate only opens with feedback, see [`Self::submit_review`].
    pub fn approve(&self, task_id: &str, gate: &str) -> Result<bool, PipelineError> {
        self.ensure_known(task_id)?;
        if gate == REVIEW_GATE {
            return Err(PipelineError::ReviewRequiresFeedback {
                task_id: task_id.to_string(),
            });
        }
        // The user line goes in before the worker wakes so it precedes
        // everything the resumed stage logs.
        let fired = match self.gates.claim(task_id, gate) {
            Some(claimed) => {
                self.registry
                    .append_log(task_id, LogRole::User, format!("Approved {gate}"));
                claimed.release(GateSignal::default())
            }
            None => false,
        };
        if !fired {
            self.registry.append_log(
                task_id,
                LogRole::Assistant,
                format!("Nothing is awaiting approval for `{gate}`"),
            );
        }
        Ok(fired)
    }

    pub fn submit_review(&self, task_id: &str, feedback: &str) -> Result<bool, PipelineError> {
        self.ensure_known(task_id)?;
        if ReviewDecision::parse(feedback).is_err() {
            return Err(PipelineError::InvalidFeedback {
                feedback: feedback.to_string(),
            });
        }
        let feedback = feedback.trim();
        let fired = match self.gates.claim(task_id, REVIEW_GATE) {
            Some(claimed) => {
                self.registry
                    .append_log(task_id, LogRole::User, format!("User Feedback: {feedback}"));
                claimed.release(GateSignal::with_feedback(feedback))
            }
            None => false,
        };
        if !fired {
            self.registry.append_log(
                task_id,
                LogRole::Assistant,
                "Nothing is awaiting review feedback",
            );
        }
        Ok(fired)
    }

    /// Starts the database-script flow on a task resting at `idle`.
    pub fn continue_task(&self, task_id: &str) -> Result<(), PipelineError> {
        let task = self.status(task_id)?;
        if self.worker_state(task_id) == Some(WorkerState::Running) {
            return Err(PipelineError::WorkerActive {
                task_id: task_id.to_string(),
            });
        }
        if task.stage != Stage::Idle {
            return Err(PipelineError::NotIdle {
                task_id: task_id.to_string(),
                stage: task.stage,
            });
        }
        self.registry
            .append_log(task_id, LogRole::User, "Continue requested");
        let working_dir = self.working_dir(task_id);
        self.spawn_worker(&task.id, Stage::GenerateCreateScript, working_dir)
    }

    /// Blocks until the task's current worker exits and returns its final
    /// state. Returns immediately when no worker handle is held.
    pub fn join(&self, task_id: &str) -> Result<Option<WorkerState>, PipelineError> {
        self.ensure_known(task_id)?;
        let handle = self.workers().take_handle(task_id);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                self.workers().fail(task_id);
            }
        }
        Ok(self.worker_state(task_id))
    }

    pub fn worker_state(&self, task_id: &str) -> Option<WorkerState> {
        self.workers().state(task_id)
    }

    /// Tasks whose worker is blocked on a gate, oldest first.
    pub fn parked_tasks(&self) -> Vec<ParkedGate> {
        self.gates.parked()
    }

    /// Withdraws the gate a task is parked on. The worker wakes, the stage
    /// fails and the task keeps its stage. `Ok(false)` when nothing was parked.
    pub fn abandon(&self, task_id: &str) -> Result<bool, PipelineError> {
        self.ensure_known(task_id)?;
        match self.gates.discard(task_id) {
            Some(gate) => {
                self.registry.append_log(
                    task_id,
                    LogRole::User,
                    format!("Abandoned the pending `{gate}` approval"),
                );
                self.runtime_log.info(
                    "gate.abandoned",
                    &format!("task_id={task_id} gate={gate}"),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reads a file from the task's working directory. `create` and `insert`
    /// name the configured database scripts; anything else must be a plain
    /// file name that resolves inside the working directory.
    pub fn read_task_file(&self, task_id: &str, name: &str) -> Result<String, PipelineError> {
        self.ensure_known(task_id)?;
        let file_name = match name {
            CREATE_GATE => self.scripts.create_script_file.as_str(),
            INSERT_GATE => self.scripts.insert_script_file.as_str(),
            other => other,
        };
        let invalid = || PipelineError::InvalidFileName {
            name: name.to_string(),
        };
        let mut components = Path::new(file_name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(invalid());
        }

        let working_dir = self.working_dir(task_id);
        let read_error = |source: io::Error, path: &Path| {
            if source.kind() == io::ErrorKind::NotFound {
                PipelineError::TaskFileNotFound {
                    task_id: task_id.to_string(),
                    name: file_name.to_string(),
                }
            } else {
                PipelineError::TaskFile {
                    path: path.display().to_string(),
                    source,
                }
            }
        };
        let root = fs::canonicalize(&working_dir).map_err(|e| read_error(e, &working_dir))?;
        let requested = working_dir.join(file_name);
        let resolved = fs::canonicalize(&requested).map_err(|e| read_error(e, &requested))?;
        // A symlink inside the working directory may still point outside it.
        if !resolved.starts_with(&root) {
            return Err(invalid());
        }
        if !resolved.is_file() {
            return Err(PipelineError::TaskFileNotFound {
                task_id: task_id.to_string(),
                name: file_name.to_string(),
            });
        }
        let bytes = fs::read(&resolved).map_err(|e| read_error(e, &resolved))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn create_task(&self, context: Map<String, Value>) -> Result<TaskId, PipelineError> {
        let mut last_error = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let task_id = TaskId::generate(now_secs()).map_err(PipelineError::TaskId)?;
            match self.registry.create(task_id.clone(), context.clone()) {
                Ok(_) => return Ok(task_id),
                Err(err @ RegistryError::AlreadyExists { .. }) => last_error = Some(err),
                Err(err) => return Err(PipelineError::from_registry(err)),
            }
        }
        Err(PipelineError::TaskId(match last_error {
            Some(err) => err.to_string(),
            None => "no attempts made".to_string(),
        }))
    }

    fn spawn_worker(
        &self,
        task_id: &TaskId,
        from: Stage,
        working_dir: PathBuf,
    ) -> Result<(), PipelineError> {
        // Reserve and attach under one lock so a fast worker cannot finish
        // between the two and leave a stale handle behind.
        let mut workers = self.workers();
        if !workers.reserve(task_id) {
            return Err(PipelineError::WorkerActive {
                task_id: task_id.to_string(),
            });
        }

        let machine = self.machine.clone();
        let registry = self.workers.clone();
        let runtime_log = self.runtime_log.clone();
        let worker_task = task_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", task_id.short()))
            .spawn(move || {
                let outcome = machine.run(&worker_task, from, &working_dir);
                let mut workers = lock_workers(&registry);
                let stopped_at = match &outcome {
                    RunOutcome::Rested(stage) => {
                        workers.stop(worker_task.as_str());
                        *stage
                    }
                    RunOutcome::Failed { stage, .. } => {
                        workers.fail(worker_task.as_str());
                        *stage
                    }
                };
                runtime_log.info(
                    "worker.stopped",
                    &format!("task_id={worker_task} stage={stopped_at}"),
                );
            });

        match spawned {
            Ok(handle) => {
                workers.attach(task_id, handle);
                Ok(())
            }
            Err(source) => {
                workers.fail(task_id.as_str());
                drop(workers);
                self.registry.set_status(
                    task_id.as_str(),
                    error_status(&format!("failed to spawn worker: {source}")),
                );
                Err(PipelineError::Spawn {
                    task_id: task_id.to_string(),
                    source,
                })
            }
        }
    }

    fn ensure_known(&self, task_id: &str) -> Result<(), PipelineError> {
        if self.registry.contains(task_id) {
            Ok(())
        } else {
            Err(PipelineError::UnknownTask {
                task_id: task_id.to_string(),
            })
        }
    }

    fn workers(&self) -> MutexGuard<'_, WorkerRegistry> {
        lock_workers(&self.workers)
    }
}

fn lock_workers(workers: &Mutex<WorkerRegistry>) -> MutexGuard<'_, WorkerRegistry> {
    workers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The free-text `context` field when present, the whole map as JSON
/// otherwise.
fn describe_context(context: &Map<String, Value>) -> String {
    match context.get("context").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => Value::Object(context.clone()).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_description_prefers_free_text_field() {
        let mut context = Map::new();
        context.insert("context".to_string(), Value::String("retail sales".into()));
        context.insert("rows".to_string(), Value::from(10));
        assert_eq!(describe_context(&context), "retail sales");

        context.remove("context");
        assert_eq!(describe_context(&context), r#"{"rows":10}"#);
    }

    #[test]
    fn configured_stage_scripts_override_built_ins() {
        let mut settings: Settings =
            serde_yaml::from_str("workspaces_path: /tmp/run_space\n").expect("settings");
        let handlers = handlers_from_settings(&settings);
        assert_eq!(
            handlers.stages(),
            vec![Stage::Cleanup, Stage::ExecuteCreate, Stage::ExecuteInsert]
        );

        settings
            .stages
            .insert(Stage::GenerateModel, PathBuf::from("/opt/model.py"));
        let handlers = handlers_from_settings(&settings);
        assert!(handlers.get(Stage::GenerateModel).is_some());
    }
}
