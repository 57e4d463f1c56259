use serde_json::{Map, Value};
use stagegate::config::ScriptsConfig;
use stagegate::gate::{CREATE_GATE, INSERT_GATE, REVIEW_GATE};
use stagegate::pipeline::{
    stage_fn, CleanupStage, HandlerSet, PipelineError, PipelineService, ScriptFileStage, Stage,
    StageError, COMPLETED_MESSAGE, REVIEW_PROMPT,
};
use stagegate::registry::{LogRole, Task};
use stagegate::runtime::{RuntimeLog, StatePaths, WorkerState};
use stagegate::sandbox::{SandboxConfig, ScriptSandbox};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const CREATE_SCRIPT: &str = "create_Database_Script.sh";
const INSERT_SCRIPT: &str = "insert_Data_Script.sh";

fn sh_sandbox() -> ScriptSandbox {
    ScriptSandbox::new(SandboxConfig {
        interpreter: "sh".to_string(),
        script_file_name: "generated_script.sh".to_string(),
        timeout_seconds: 10,
        stability_poll_interval_ms: 20,
        stability_max_wait_ms: 500,
        output_drain_ms: 200,
        ..SandboxConfig::default()
    })
}

fn service(root: &Path, handlers: HandlerSet) -> PipelineService {
    PipelineService::new(root.join("run_space"), sh_sandbox(), handlers)
}

fn context(text: &str) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("context".to_string(), Value::String(text.to_string()));
    context
}

fn wait_for(service: &PipelineService, task_id: &str, what: &str, check: impl Fn(&Task) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let task = service.status(task_id).expect("status");
        if check(&task) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}; stage={} status={}",
            task.stage,
            task.status
        );
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_gate(service: &PipelineService, task_id: &str, gate: &str) {
    wait_for(service, task_id, gate, |task| {
        task.awaiting_approval.as_deref() == Some(gate)
    });
}

fn log_texts(task: &Task) -> Vec<String> {
    task.logs.iter().map(|entry| entry.text.clone()).collect()
}

/// Handlers that generate the two database scripts the way the generator
/// stages would, writing them into the task's working directory.
fn database_script_handlers() -> HandlerSet {
    HandlerSet::new()
        .with(
            Stage::GenerateCreateScript,
            stage_fn(|ctx| {
                fs::write(ctx.path(CREATE_SCRIPT), "echo 'CREATE TABLE fact_sales;' > create.sql\n")
                    .map_err(|err| StageError::failed(err.to_string()))?;
                ctx.logger.log("CREATE script generated.");
                ctx.default_next()
            }),
        )
        .with(Stage::ExecuteCreate, ScriptFileStage::new(CREATE_SCRIPT))
        .with(
            Stage::GenerateInsertScript,
            stage_fn(|ctx| {
                fs::write(ctx.path(INSERT_SCRIPT), "echo 'order_id,amount' > rows.csv\n")
                    .map_err(|err| StageError::failed(err.to_string()))?;
                ctx.default_next()
            }),
        )
        .with(Stage::ExecuteInsert, ScriptFileStage::new(INSERT_SCRIPT))
        .with(Stage::Cleanup, CleanupStage)
}

#[test]
fn generate_model_failure_halts_with_error_status() {
    let dir = tempdir().expect("tempdir");
    let handlers = HandlerSet::new().with(
        Stage::GenerateModel,
        stage_fn(|_| Err(StageError::failed("metadata.json is empty"))),
    );
    let service = service(dir.path(), handlers);

    let task_id = service.start(context("retail sales")).expect("start");
    assert_eq!(
        service.join(task_id.as_str()).expect("join"),
        Some(WorkerState::Error)
    );

    let task = service.status(task_id.as_str()).expect("status");
    assert_eq!(task.status, "Error: metadata.json is empty");
    assert_eq!(task.stage, Stage::GenerateModel);
    assert_eq!(task.awaiting_approval, None);
    let logs = log_texts(&task);
    assert_eq!(logs.first().map(String::as_str), Some("User Context: retail sales"));
    assert_eq!(task.logs[0].role, LogRole::User);
    assert!(logs.contains(&"start complete".to_string()));
    assert_eq!(
        logs.last().map(String::as_str),
        Some("Error during generate_model: metadata.json is empty")
    );
    assert!(!logs.iter().any(|text| text == "generate_model complete"));
}

#[test]
fn create_gate_ignores_wrong_gate_and_proceeds_on_right_one() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), database_script_handlers());
    let task_id = service.start(context("orders")).expect("start");
    let id = task_id.as_str();

    wait_for_gate(&service, id, REVIEW_GATE);
    assert_eq!(service.status(id).expect("status").status, "Awaiting user review");
    assert!(service.submit_review(id, "yes").expect("review"));
    assert_eq!(service.join(id).expect("join"), Some(WorkerState::Stopped));
    assert_eq!(service.status(id).expect("status").stage, Stage::Idle);

    service.continue_task(id).expect("continue");
    wait_for_gate(&service, id, CREATE_GATE);
    let parked = service.status(id).expect("status");
    assert_eq!(parked.stage, Stage::AwaitCreate);
    assert_eq!(parked.status, "Awaiting approval: create");
    assert_eq!(service.parked_tasks().len(), 1);

    assert!(!service.approve(id, INSERT_GATE).expect("approve insert"));
    let unchanged = service.status(id).expect("status");
    assert_eq!(unchanged.awaiting_approval.as_deref(), Some(CREATE_GATE));
    assert_eq!(unchanged.stage, Stage::AwaitCreate);

    assert!(service.approve(id, CREATE_GATE).expect("approve create"));
    wait_for(&service, id, "execute_create to finish", |task| {
        task.stage > Stage::ExecuteCreate
    });
    assert!(service
        .status(id)
        .expect("status")
        .artifacts
        .contains(&"create.sql".to_string()));

    wait_for_gate(&service, id, INSERT_GATE);
    assert!(!service.approve(id, CREATE_GATE).expect("stale create"));
    assert!(service.approve(id, INSERT_GATE).expect("approve insert"));
    assert_eq!(service.join(id).expect("join"), Some(WorkerState::Stopped));

    let done = service.status(id).expect("status");
    assert_eq!(done.stage, Stage::Completed);
    assert_eq!(done.status, "Completed");
    assert_eq!(done.awaiting_approval, None);
    assert!(done.artifacts.contains(&"rows.csv".to_string()));
    assert_eq!(
        done.logs.last().map(|entry| entry.text.as_str()),
        Some(COMPLETED_MESSAGE)
    );
    assert!(service.parked_tasks().is_empty());
    assert!(done
        .system_logs
        .iter()
        .any(|entry| entry.text.contains("entering execute_insert")));
}

#[test]
fn failing_create_script_reports_stderr() {
    let dir = tempdir().expect("tempdir");
    let handlers = HandlerSet::new()
        .with(
            Stage::GenerateCreateScript,
            stage_fn(|ctx| {
                fs::write(
                    ctx.path(CREATE_SCRIPT),
                    "echo 'relation fact_sales already exists' 1>&2\nexit 1\n",
                )
                .map_err(|err| StageError::failed(err.to_string()))?;
                ctx.default_next()
            }),
        )
        .with(Stage::ExecuteCreate, ScriptFileStage::new(CREATE_SCRIPT));
    let service = service(dir.path(), handlers);
    let task_id = service.start(Map::new()).expect("start");
    let id = task_id.as_str();

    wait_for_gate(&service, id, REVIEW_GATE);
    assert!(service.submit_review(id, "YES").expect("review"));
    service.join(id).expect("join");
    service.continue_task(id).expect("continue");
    wait_for_gate(&service, id, CREATE_GATE);
    assert!(service.approve(id, CREATE_GATE).expect("approve"));
    assert_eq!(service.join(id).expect("join"), Some(WorkerState::Error));

    let task = service.status(id).expect("status");
    assert_eq!(task.stage, Stage::ExecuteCreate);
    assert!(task.status.starts_with("Error: script failed"));
    assert!(task.status.contains("relation fact_sales already exists"));
}

#[test]
fn review_rejection_loops_back_to_phase_one() {
    let dir = tempdir().expect("tempdir");
    let phase1_runs = Arc::new(AtomicUsize::new(0));
    let counter = phase1_runs.clone();
    let handlers = HandlerSet::new().with(
        Stage::RunPhase1,
        stage_fn(move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.default_next()
        }),
    );
    let service = service(dir.path(), handlers);
    let task_id = service.start(context("loop")).expect("start");
    let id = task_id.as_str();

    wait_for_gate(&service, id, REVIEW_GATE);
    assert_eq!(phase1_runs.load(Ordering::SeqCst), 1);
    let first_prompt = service.status(id).expect("status");
    assert_eq!(first_prompt.last_log().map(|l| l.text.as_str()), Some(REVIEW_PROMPT));

    let err = service
        .submit_review(id, "maybe later")
        .expect_err("malformed feedback");
    assert!(matches!(err, PipelineError::InvalidFeedback { .. }));
    assert!(matches!(
        service.submit_review(id, "   "),
        Err(PipelineError::InvalidFeedback { .. })
    ));
    assert_eq!(
        service.status(id).expect("status").awaiting_approval.as_deref(),
        Some(REVIEW_GATE)
    );

    assert!(service
        .submit_review(id, "no split the date dimension")
        .expect("reject"));
    wait_for(&service, id, "second review", |task| {
        task.awaiting_approval.as_deref() == Some(REVIEW_GATE)
            && task.logs.iter().filter(|l| l.text == REVIEW_PROMPT).count() == 2
    });
    assert_eq!(phase1_runs.load(Ordering::SeqCst), 2);

    assert!(service.submit_review(id, "yes").expect("accept"));
    service.join(id).expect("join");
    let task = service.status(id).expect("status");
    assert_eq!(task.stage, Stage::Idle);
    assert_eq!(phase1_runs.load(Ordering::SeqCst), 2);
    let logs = log_texts(&task);
    assert!(logs.contains(&"User Feedback: no split the date dimension".to_string()));
    assert!(logs.contains(&"user_review complete".to_string()));
}

#[test]
fn approvals_without_a_waiter_are_recorded_no_ops() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), HandlerSet::new());
    let task_id = service.start(Map::new()).expect("start");
    let id = task_id.as_str();

    wait_for_gate(&service, id, REVIEW_GATE);
    let before = service.status(id).expect("status").logs.len();
    assert!(!service.approve(id, CREATE_GATE).expect("approve"));
    let after = service.status(id).expect("status");
    assert_eq!(after.logs.len(), before + 1);
    assert_eq!(after.awaiting_approval.as_deref(), Some(REVIEW_GATE));

    assert!(matches!(
        service.approve("task-missing", CREATE_GATE),
        Err(PipelineError::UnknownTask { .. })
    ));
    assert!(matches!(
        service.status("task-missing"),
        Err(PipelineError::UnknownTask { .. })
    ));

    assert!(matches!(
        service.continue_task(id),
        Err(PipelineError::WorkerActive { .. })
    ));
    assert!(service.submit_review(id, "yes").expect("review"));
    service.join(id).expect("join");
    assert!(!service.submit_review(id, "yes").expect("second review"));
}

#[test]
fn continue_requires_an_idle_task() {
    let dir = tempdir().expect("tempdir");
    let handlers = HandlerSet::new().with(
        Stage::GenerateSchema,
        stage_fn(|_| Err(StageError::failed("plantuml unavailable"))),
    );
    let service = service(dir.path(), handlers);
    let task_id = service.start(Map::new()).expect("start");
    service.join(task_id.as_str()).expect("join");

    match service.continue_task(task_id.as_str()) {
        Err(PipelineError::NotIdle { stage, .. }) => assert_eq!(stage, Stage::GenerateSchema),
        other => panic!("expected NotIdle, got {other:?}"),
    }
}

#[test]
fn handler_panic_marks_task_errored_and_frees_the_worker() {
    let dir = tempdir().expect("tempdir");
    let handlers = HandlerSet::new().with(
        Stage::Correction,
        stage_fn(|_| panic!("errors.json missing")),
    );
    let service = service(dir.path(), handlers);
    let task_id = service.start(Map::new()).expect("start");

    assert_eq!(
        service.join(task_id.as_str()).expect("join"),
        Some(WorkerState::Error)
    );
    let task = service.status(task_id.as_str()).expect("status");
    assert_eq!(task.stage, Stage::Correction);
    assert_eq!(task.status, "Error: stage handler panicked: errors.json missing");
}

#[test]
fn concurrent_pollers_never_see_logs_shrink() {
    let dir = tempdir().expect("tempdir");
    let handlers = HandlerSet::new().with(
        Stage::RunPhase2,
        stage_fn(|ctx| {
            for index in 0..300 {
                ctx.logger.log(format!("validation check {index} passed"));
                ctx.logger.system(format!("[phase2] row {index}"));
            }
            ctx.default_next()
        }),
    );
    let service = Arc::new(service(dir.path(), handlers));
    let task_id = service.start(Map::new()).expect("start");

    let pollers = (0..4)
        .map(|_| {
            let service = service.clone();
            let id = task_id.clone();
            thread::spawn(move || {
                let mut last_logs = 0usize;
                let mut last_system = 0usize;
                let mut seen_prefix: Vec<String> = Vec::new();
                let deadline = Instant::now() + Duration::from_secs(15);
                loop {
                    let task = service.status(id.as_str()).expect("status");
                    assert!(task.logs.len() >= last_logs, "logs shrank");
                    assert!(task.system_logs.len() >= last_system, "system logs shrank");
                    let texts = log_texts(&task);
                    assert_eq!(&texts[..seen_prefix.len()], seen_prefix.as_slice());
                    last_logs = task.logs.len();
                    last_system = task.system_logs.len();
                    seen_prefix = texts;
                    if task.awaiting_approval.is_some() || Instant::now() > deadline {
                        return last_logs;
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for poller in pollers {
        let observed = poller.join().expect("poller");
        assert!(observed > 300);
    }
    wait_for_gate(&service, task_id.as_str(), REVIEW_GATE);
    let task = service.status(task_id.as_str()).expect("status");
    let checks = task
        .logs
        .iter()
        .filter(|entry| entry.text.starts_with("validation check"))
        .map(|entry| entry.text.clone())
        .collect::<Vec<_>>();
    let expected = (0..300)
        .map(|index| format!("validation check {index} passed"))
        .collect::<Vec<_>>();
    assert_eq!(checks, expected);
}

#[test]
fn runtime_log_records_engine_events() {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("state"));
    let handlers = HandlerSet::new().with(
        Stage::GenerateModel,
        stage_fn(|_| Err(StageError::failed("boom"))),
    );
    let service = service(dir.path(), handlers).with_runtime_log(RuntimeLog::new(&paths));
    let task_id = service.start(Map::new()).expect("start");
    service.join(task_id.as_str()).expect("join");

    let raw = fs::read_to_string(paths.runtime_log_path()).expect("runtime log");
    let events = raw
        .lines()
        .map(|line| {
            let value: Value = serde_json::from_str(line).expect("json line");
            value["event"].as_str().unwrap_or_default().to_string()
        })
        .collect::<Vec<_>>();
    for expected in ["task.started", "stage.started", "stage.succeeded", "stage.failed"] {
        assert!(events.iter().any(|event| event == expected), "missing {expected}");
    }
    assert_eq!(events.last().map(String::as_str), Some("worker.stopped"));
}

#[test]
fn bare_approval_of_the_review_gate_leaves_the_task_parked() {
    let dir = tempdir().expect("tempdir");
    let service = service(dir.path(), HandlerSet::new());
    let task_id = service.start(Map::new()).expect("start");
    let id = task_id.as_str();

    wait_for_gate(&service, id, REVIEW_GATE);
    assert!(matches!(
        service.approve(id, REVIEW_GATE),
        Err(PipelineError::ReviewRequiresFeedback { .. })
    ));
    let task = service.status(id).expect("status");
    assert_eq!(task.stage, Stage::UserReview);
    assert_eq!(task.awaiting_approval.as_deref(), Some(REVIEW_GATE));
    assert!(!task.is_errored());
    assert_eq!(service.worker_state(id), Some(WorkerState::Running));

    assert!(service.submit_review(id, "yes").expect("review"));
    assert_eq!(service.join(id).expect("join"), Some(WorkerState::Stopped));
    assert_eq!(service.status(id).expect("status").stage, Stage::Idle);
}

fn service_at_create_gate(root: &Path) -> (PipelineService, String) {
    let service = service(root, database_script_handlers()).with_scripts(ScriptsConfig {
        create_script_file: CREATE_SCRIPT.to_string(),
        insert_script_file: INSERT_SCRIPT.to_string(),
    });
    let task_id = service.start(Map::new()).expect("start").to_string();
    wait_for_gate(&service, &task_id, REVIEW_GATE);
    assert!(service.submit_review(&task_id, "yes").expect("review"));
    service.join(&task_id).expect("join");
    service.continue_task(&task_id).expect("continue");
    wait_for_gate(&service, &task_id, CREATE_GATE);
    (service, task_id)
}

#[test]
fn generated_scripts_and_task_files_can_be_read_back() {
    let dir = tempdir().expect("tempdir");
    let (service, id) = service_at_create_gate(dir.path());

    let script = service.read_task_file(&id, CREATE_GATE).expect("create script");
    assert!(script.contains("CREATE TABLE fact_sales"));
    assert!(matches!(
        service.read_task_file(&id, INSERT_GATE),
        Err(PipelineError::TaskFileNotFound { .. })
    ));

    fs::write(service.working_dir(&id).join("notes.txt"), "star schema\n").expect("notes");
    assert_eq!(
        service.read_task_file(&id, "notes.txt").expect("notes"),
        "star schema\n"
    );
    assert!(matches!(
        service.read_task_file(&id, "missing.csv"),
        Err(PipelineError::TaskFileNotFound { .. })
    ));
    assert!(matches!(
        service.read_task_file("task-missing", "notes.txt"),
        Err(PipelineError::UnknownTask { .. })
    ));

    assert!(service.approve(&id, CREATE_GATE).expect("approve create"));
    wait_for_gate(&service, &id, INSERT_GATE);
    assert!(service.approve(&id, INSERT_GATE).expect("approve insert"));
    service.join(&id).expect("join");
}

#[test]
fn task_file_reads_stay_inside_the_task_directory() {
    let dir = tempdir().expect("tempdir");
    let (service, id) = service_at_create_gate(dir.path());
    fs::write(dir.path().join("secret.txt"), "outside").expect("secret");

    for name in ["../secret.txt", "/etc/passwd", "sub/notes.txt", "", "."] {
        assert!(
            matches!(
                service.read_task_file(&id, name),
                Err(PipelineError::InvalidFileName { .. })
            ),
            "name `{name}` should be rejected"
        );
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(
            dir.path().join("secret.txt"),
            service.working_dir(&id).join("link.txt"),
        )
        .expect("symlink");
        assert!(matches!(
            service.read_task_file(&id, "link.txt"),
            Err(PipelineError::InvalidFileName { .. })
        ));
    }

    assert!(service.abandon(&id).expect("abandon"));
    service.join(&id).expect("join");
}

#[test]
fn abandoning_a_parked_task_fails_its_stage_and_frees_the_worker() {
    let dir = tempdir().expect("tempdir");
    let (service, id) = service_at_create_gate(dir.path());
    assert_eq!(service.parked_tasks().len(), 1);

    assert!(service.abandon(&id).expect("abandon"));
    assert_eq!(service.join(&id).expect("join"), Some(WorkerState::Error));

    let task = service.status(&id).expect("status");
    assert_eq!(task.stage, Stage::AwaitCreate);
    assert_eq!(task.awaiting_approval, None);
    assert!(task.status.starts_with("Error: gate `create`"));
    assert!(log_texts(&task).contains(&"Abandoned the pending `create` approval".to_string()));
    assert!(service.parked_tasks().is_empty());
    assert!(!service.abandon(&id).expect("second abandon"));
    assert!(!service.approve(&id, CREATE_GATE).expect("late approval"));
}
