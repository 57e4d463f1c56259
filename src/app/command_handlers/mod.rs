use crate::app::cli::{help_text, parse_cli_verb, CliVerb};
use crate::config::{load_settings, Settings};
use crate::runtime::{bootstrap_state_root, RuntimeLog};
use std::path::Path;

pub mod exec;
pub mod run;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Run => run::cmd_run(&args[1..]),
        CliVerb::Exec => exec::cmd_exec(&args[1..]),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}

/// Loads settings and prepares the state root that holds the runtime log.
pub(crate) fn load_runtime(config: Option<&str>) -> Result<(Settings, RuntimeLog), String> {
    let settings = load_settings(config.map(Path::new)).map_err(|e| e.to_string())?;
    let paths = settings.state_paths().map_err(|e| e.to_string())?;
    bootstrap_state_root(&paths).map_err(|e| e.to_string())?;
    Ok((settings, RuntimeLog::new(&paths)))
}
