use crate::app::cli::console_help_lines;
use crate::pipeline::PipelineService;
use std::io::{self, BufRead, Write};

const CONSOLE_EXIT_COMMANDS: &[&str] = &["exit", "quit", "/exit"];

pub fn run_console_stdio(service: &PipelineService, task_id: &str) -> Result<String, String> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let stdout = io::stdout();
    let mut output = stdout.lock();
    run_console(service, task_id, &mut input, &mut output)
}

/// Line-oriented operator console bound to one task.
pub fn run_console<R: BufRead, W: Write>(
    service: &PipelineService,
    task_id: &str,
    input: &mut R,
    output: &mut W,
) -> Result<String, String> {
    let mut session = ConsoleSession {
        service,
        task_id,
        shown_logs: 0,
    };
    emit(output, &format!("task_id={task_id}"))?;
    emit(output, "type `help` for commands, `exit` to leave")?;

    loop {
        write!(output, "stagegate> ").map_err(|e| format!("failed to write prompt: {e}"))?;
        output
            .flush()
            .map_err(|e| format!("failed to flush prompt: {e}"))?;

        let mut line = String::new();
        let read = input
            .read_line(&mut line)
            .map_err(|e| format!("failed to read console input: {e}"))?;
        if read == 0 {
            break;
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if CONSOLE_EXIT_COMMANDS.contains(&command) {
            break;
        }

        match session.execute(command) {
            Ok(reply) => emit(output, &reply)?,
            Err(err) => emit(output, &format!("error: {err}"))?,
        }
    }

    Ok(format!("console closed\ntask_id={task_id}"))
}

struct ConsoleSession<'a> {
    service: &'a PipelineService,
    task_id: &'a str,
    shown_logs: usize,
}

impl ConsoleSession<'_> {
    fn execute(&mut self, command: &str) -> Result<String, String> {
        let (verb, rest) = match command.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (command, ""),
        };
        match verb {
            "status" => self.status(),
            "logs" => self.logs(),
            "approve" => {
                if rest.is_empty() {
                    return Err("usage: approve <gate>".to_string());
                }
                let fired = self
                    .service
                    .approve(self.task_id, rest)
                    .map_err(|e| e.to_string())?;
                Ok(format!("approved={fired}"))
            }
            "review" => {
                let fired = self
                    .service
                    .submit_review(self.task_id, rest)
                    .map_err(|e| e.to_string())?;
                Ok(format!("accepted={fired}"))
            }
            "continue" => {
                self.service
                    .continue_task(self.task_id)
                    .map_err(|e| e.to_string())?;
                Ok("continued=true".to_string())
            }
            "show" => {
                if rest.is_empty() {
                    return Err("usage: show <create|insert|file>".to_string());
                }
                let content = self
                    .service
                    .read_task_file(self.task_id, rest)
                    .map_err(|e| e.to_string())?;
                if content.trim().is_empty() {
                    return Ok(format!("{rest} is empty"));
                }
                Ok(content.trim_end().to_string())
            }
            "abandon" => {
                let abandoned = self
                    .service
                    .abandon(self.task_id)
                    .map_err(|e| e.to_string())?;
                Ok(format!("abandoned={abandoned}"))
            }
            "parked" => {
                let parked = self.service.parked_tasks();
                if parked.is_empty() {
                    return Ok("parked=none".to_string());
                }
                Ok(parked
                    .iter()
                    .map(|gate| {
                        format!(
                            "task_id={} gate={} since={}",
                            gate.task_id, gate.gate, gate.opened_at
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "help" => Ok(console_help_lines().join("\n")),
            other => Err(format!("unknown console command `{other}`")),
        }
    }

    fn status(&self) -> Result<String, String> {
        let task = self
            .service
            .status(self.task_id)
            .map_err(|e| e.to_string())?;
        Ok([
            format!("stage={}", task.stage),
            format!("status={}", task.status),
            format!(
                "awaiting_approval={}",
                task.awaiting_approval.as_deref().unwrap_or("none")
            ),
            format!("artifacts={}", task.artifacts.join(",")),
        ]
        .join("\n"))
    }

    fn logs(&mut self) -> Result<String, String> {
        let task = self
            .service
            .status(self.task_id)
            .map_err(|e| e.to_string())?;
        let fresh = task
            .logs
            .iter()
            .skip(self.shown_logs)
            .map(|entry| format!("[{}] {}", entry.role, entry.text))
            .collect::<Vec<_>>();
        self.shown_logs = task.logs.len();
        if fresh.is_empty() {
            return Ok("no new log lines".to_string());
        }
        Ok(fresh.join("\n"))
    }
}

fn emit<W: Write>(output: &mut W, text: &str) -> Result<(), String> {
    writeln!(output, "{text}").map_err(|e| format!("failed to write console output: {e}"))?;
    output
        .flush()
        .map_err(|e| format!("failed to flush console output: {e}"))
}
