use super::process::{exit_code_of, isolate_process_group, terminate_tree};
use super::snapshot::DirSnapshot;
use super::stability::await_stable_sizes;
use super::{
    ExecutionResult, OutputLine, OutputStream, SandboxConfig, EXIT_INTERNAL, EXIT_LAUNCH_FAILED,
    EXIT_TIMEOUT, EXIT_WRITE_FAILED,
};
use crate::runtime::RuntimeLog;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SUPERVISE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct OutputCapture {
    stdout: String,
    stderr: String,
}

impl OutputCapture {
    fn push(&mut self, line: &OutputLine) {
        match line.stream {
            OutputStream::Stdout => self.stdout.push_str(&line.text),
            OutputStream::Stderr => self.stderr.push_str(&line.text),
            OutputStream::Notice => {}
        }
    }
}

enum Supervised {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed(std::io::Error),
}

/// Runs generated scripts as child processes inside a task's working
/// directory.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    config: SandboxConfig,
    runtime_log: RuntimeLog,
}

impl ScriptSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            runtime_log: RuntimeLog::disabled(),
        }
    }

    pub fn with_runtime_log(mut self, runtime_log: RuntimeLog) -> Self {
        self.runtime_log = runtime_log;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn script_path(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.config.script_file_name)
    }

    pub fn run(&self, source_text: &str, working_dir: &Path, timeout: Duration) -> ExecutionResult {
        self.run_with_output(source_text, working_dir, timeout, &mut |_| {})
    }

    /// Like [`ScriptSandbox::run`], calling `on_output` for every line while the
    /// child is still running.
    pub fn run_with_output(
        &self,
        source_text: &str,
        working_dir: &Path,
        timeout: Duration,
        on_output: &mut dyn FnMut(&OutputLine),
    ) -> ExecutionResult {
        let started = Instant::now();
        let script_path = self.script_path(working_dir);

        if let Err(err) = fs::create_dir_all(working_dir) {
            return self.internal_failure(
                EXIT_WRITE_FAILED,
                script_path,
                format!(
                    "failed to create working directory {}: {err}",
                    working_dir.display()
                ),
                started,
            );
        }

        let before = match DirSnapshot::capture(working_dir) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return self.internal_failure(
                    EXIT_INTERNAL,
                    script_path,
                    format!("failed to scan {}: {err}", working_dir.display()),
                    started,
                )
            }
        };

        if let Err(err) = fs::write(&script_path, source_text) {
            return self.internal_failure(
                EXIT_WRITE_FAILED,
                script_path.clone(),
                format!("failed to write script {}: {err}", script_path.display()),
                started,
            );
        }

        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.interpreter_args)
            .arg(&self.config.script_file_name)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return self.internal_failure(
                    EXIT_LAUNCH_FAILED,
                    script_path,
                    format!("failed to launch `{}`: {err}", self.config.interpreter),
                    started,
                )
            }
        };

        let (sender, receiver) = mpsc::channel::<OutputLine>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, OutputStream::Stdout, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, OutputStream::Stderr, sender.clone()));
        }
        drop(sender);

        let mut capture = OutputCapture::default();
        let outcome = supervise(&mut child, &receiver, timeout, &mut capture, on_output);

        let exit_code = match outcome {
            Supervised::Exited(status) => exit_code_of(status),
            Supervised::TimedOut => {
                terminate_tree(&mut child);
                let _ = child.wait();
                drain_output(&receiver, self.config.output_drain(), readers, &mut capture, on_output);
                capture
                    .stderr
                    .push_str(&format!("Timeout after {}s", timeout.as_secs_f64()));
                self.runtime_log.warn(
                    "sandbox.timeout",
                    &format!(
                        "script={} timeout_ms={}",
                        script_path.display(),
                        timeout.as_millis()
                    ),
                );
                return ExecutionResult {
                    exit_code: EXIT_TIMEOUT,
                    stdout: capture.stdout,
                    stderr: capture.stderr,
                    artifacts: Vec::new(),
                    script_path,
                    timed_out: true,
                    duration_ms: elapsed_ms(started),
                };
            }
            Supervised::WaitFailed(err) => {
                terminate_tree(&mut child);
                let _ = child.wait();
                drain_output(&receiver, self.config.output_drain(), readers, &mut capture, on_output);
                capture
                    .stderr
                    .push_str(&format!("failed to wait for script process: {err}"));
                return ExecutionResult {
                    exit_code: EXIT_INTERNAL,
                    stdout: capture.stdout,
                    stderr: capture.stderr,
                    artifacts: Vec::new(),
                    script_path,
                    timed_out: false,
                    duration_ms: elapsed_ms(started),
                };
            }
        };

        drain_output(&receiver, self.config.output_drain(), readers, &mut capture, on_output);

        let artifacts = match DirSnapshot::capture(working_dir) {
            Ok(after) => {
                let candidates = after
                    .changed_since(&before)
                    .into_iter()
                    .filter(|path| path != &script_path && self.config.is_interesting(path))
                    .collect::<Vec<_>>();
                await_stable_sizes(
                    candidates,
                    self.config.stability_poll_interval(),
                    self.config.stability_max_wait(),
                )
            }
            Err(err) => {
                self.runtime_log.warn(
                    "sandbox.scan_failed",
                    &format!("dir={} error={err}", working_dir.display()),
                );
                Vec::new()
            }
        };

        for artifact in artifacts.iter().filter(|artifact| !artifact.stable) {
            let message = format!(
                "artifact {} still changing after {}ms; reporting it as unstable",
                artifact.path.display(),
                self.config.stability_max_wait_ms
            );
            self.runtime_log.warn("sandbox.artifact_unstable", &message);
            on_output(&OutputLine {
                stream: OutputStream::Notice,
                text: message,
            });
        }

        ExecutionResult {
            exit_code,
            stdout: capture.stdout,
            stderr: capture.stderr,
            artifacts,
            script_path,
            timed_out: false,
            duration_ms: elapsed_ms(started),
        }
    }

    fn internal_failure(
        &self,
        exit_code: i32,
        script_path: PathBuf,
        message: String,
        started: Instant,
    ) -> ExecutionResult {
        self.runtime_log.error(
            "sandbox.failed",
            &format!("exit_code={exit_code} {message}"),
        );
        ExecutionResult {
            exit_code,
            stdout: String::new(),
            stderr: message,
            artifacts: Vec::new(),
            script_path,
            timed_out: false,
            duration_ms: elapsed_ms(started),
        }
    }
}

fn supervise(
    child: &mut Child,
    receiver: &Receiver<OutputLine>,
    timeout: Duration,
    capture: &mut OutputCapture,
    on_output: &mut dyn FnMut(&OutputLine),
) -> Supervised {
    let deadline = Instant::now() + timeout;
    let mut streams_open = true;
    loop {
        if streams_open {
            match receiver.recv_timeout(SUPERVISE_POLL) {
                Ok(line) => {
                    capture.push(&line);
                    on_output(&line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => streams_open = false,
            }
        } else {
            thread::sleep(SUPERVISE_POLL);
        }

        match child.try_wait() {
            Ok(Some(status)) => return Supervised::Exited(status),
            Ok(None) => {}
            Err(err) => return Supervised::WaitFailed(err),
        }
        if Instant::now() >= deadline {
            return Supervised::TimedOut;
        }
    }
}

/// Collects output still in flight after the child is gone. Detached
/// grandchildren can keep the pipes open, so this is bounded by `max_wait`;
/// reader threads are only joined once both streams have closed.
fn drain_output(
    receiver: &Receiver<OutputLine>,
    max_wait: Duration,
    readers: Vec<JoinHandle<()>>,
    capture: &mut OutputCapture,
    on_output: &mut dyn FnMut(&OutputLine),
) {
    let deadline = Instant::now() + max_wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        match receiver.recv_timeout(remaining) {
            Ok(line) => {
                capture.push(&line);
                on_output(&line);
            }
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for reader in readers {
        let _ = reader.join();
    }
}

fn spawn_line_reader<R>(source: R, stream: OutputStream, sender: Sender<OutputLine>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = OutputLine {
                        stream,
                        text: String::from_utf8_lossy(&buf).into_owned(),
                    };
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
