use super::load_runtime;
use crate::app::cli::parse_run_args;
use crate::app::console::run_console_stdio;
use crate::pipeline::PipelineService;
use serde_json::{Map, Value};

pub fn cmd_run(args: &[String]) -> Result<String, String> {
    let parsed = parse_run_args(args)?;
    let (settings, runtime_log) = load_runtime(parsed.config.as_deref())?;
    let service = PipelineService::from_settings(&settings, runtime_log);

    let mut context = Map::new();
    for (key, value) in parsed.context {
        context.insert(key, Value::String(value));
    }
    let task_id = service.start(context).map_err(|e| e.to_string())?;
    run_console_stdio(&service, task_id.as_str())
}
