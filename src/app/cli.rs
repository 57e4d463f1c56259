#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Exec,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "exec" => CliVerb::Exec,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Commands:".to_string(),
        "  run [--config <path>] [key=value ...]   Start a task and attach a console to it"
            .to_string(),
        "  exec [--config <path>] <script> [--timeout <secs>]".to_string(),
        "                                          Run one script in the sandbox, print JSON"
            .to_string(),
        "  help                                    Show this help".to_string(),
    ]
}

pub fn console_help_lines() -> Vec<String> {
    vec![
        "Console commands:".to_string(),
        "  status              Show stage, status and pending approval".to_string(),
        "  logs                Print task log lines not shown yet".to_string(),
        "  approve <gate>      Approve the `create` or `insert` gate".to_string(),
        "  review <feedback>   Answer the review with `yes` or `no <details>`".to_string(),
        "  continue            Start the database-script flow from idle".to_string(),
        "  show <name>         Print `create`, `insert` or a file from the task directory"
            .to_string(),
        "  parked              List tasks waiting on a gate".to_string(),
        "  abandon             Withdraw the gate this task is parked on".to_string(),
        "  exit                Leave the console".to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    let mut lines = cli_help_lines();
    lines.push(String::new());
    lines.extend(console_help_lines());
    lines.join("\n")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    pub config: Option<String>,
    pub context: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecArgs {
    pub config: Option<String>,
    pub script: String,
    pub timeout_seconds: Option<u64>,
}

pub fn parse_run_args(args: &[String]) -> Result<RunArgs, String> {
    let mut parsed = RunArgs::default();
    let mut index = 0;
    while index < args.len() {
        let arg = args[index].as_str();
        if arg == "--config" {
            parsed.config = Some(flag_value(args, index, "--config")?);
            index += 2;
            continue;
        }
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got `{arg}`"))?;
        if key.trim().is_empty() {
            return Err(format!("context key must be non-empty in `{arg}`"));
        }
        parsed
            .context
            .push((key.trim().to_string(), value.to_string()));
        index += 1;
    }
    Ok(parsed)
}

pub fn parse_exec_args(args: &[String]) -> Result<ExecArgs, String> {
    let usage = "usage: exec [--config <path>] <script> [--timeout <secs>]";
    let mut config = None;
    let mut script = None;
    let mut timeout_seconds = None;
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                config = Some(flag_value(args, index, "--config")?);
                index += 2;
            }
            "--timeout" => {
                let raw = flag_value(args, index, "--timeout")?;
                let secs = raw
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| format!("invalid --timeout `{raw}`: expected seconds > 0"))?;
                timeout_seconds = Some(secs);
                index += 2;
            }
            other if script.is_none() && !other.starts_with("--") => {
                script = Some(other.to_string());
                index += 1;
            }
            other => return Err(format!("unexpected argument `{other}`\n{usage}")),
        }
    }
    Ok(ExecArgs {
        config,
        script: script.ok_or_else(|| usage.to_string())?,
        timeout_seconds,
    })
}

fn flag_value(args: &[String], index: usize, flag: &str) -> Result<String, String> {
    args.get(index + 1)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}
