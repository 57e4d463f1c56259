use super::load_runtime;
use crate::app::cli::parse_exec_args;
use crate::sandbox::ScriptSandbox;
use crate::shared::{now_secs, TaskId};
use std::fs;
use std::time::Duration;

/// Runs one script file through the sandbox in a fresh directory under
/// `workspaces_path` and renders the result as JSON.
pub fn cmd_exec(args: &[String]) -> Result<String, String> {
    let parsed = parse_exec_args(args)?;
    let (settings, runtime_log) = load_runtime(parsed.config.as_deref())?;
    let source = fs::read_to_string(&parsed.script)
        .map_err(|e| format!("failed to read script {}: {e}", parsed.script))?;

    let run_id = TaskId::generate(now_secs())?;
    let working_dir = settings
        .workspaces_path
        .join(format!("exec-{}", run_id.as_str().trim_start_matches("task-")));
    let timeout = parsed
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.sandbox.timeout());

    let sandbox = ScriptSandbox::new(settings.sandbox.clone()).with_runtime_log(runtime_log);
    let result = sandbox.run(&source, &working_dir, timeout);
    serde_json::to_string_pretty(&result).map_err(|e| format!("failed to encode result: {e}"))
}
