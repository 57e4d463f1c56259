use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod process;
pub mod runner;
pub mod snapshot;
pub mod stability;

pub use runner::ScriptSandbox;
pub use snapshot::{DirSnapshot, FileStamp};
pub use stability::await_stable_sizes;

/// The child did not finish within its time budget and was killed.
pub const EXIT_TIMEOUT: i32 = -1;
/// The working directory or the script file could not be written.
pub const EXIT_WRITE_FAILED: i32 = -2;
/// The interpreter process could not be started.
pub const EXIT_LAUNCH_FAILED: i32 = -3;
/// Supervising the running child failed (wait or directory scan errors).
pub const EXIT_INTERNAL: i32 = -4;

pub const DEFAULT_ARTIFACT_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "svg", "gif", "pdf", "csv", "txt", "sql"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    #[serde(default = "default_script_file_name")]
    pub script_file_name: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_stability_poll_interval_ms")]
    pub stability_poll_interval_ms: u64,
    #[serde(default = "default_stability_max_wait_ms")]
    pub stability_max_wait_ms: u64,
    #[serde(default = "default_output_drain_ms")]
    pub output_drain_ms: u64,
    #[serde(default = "default_artifact_extensions")]
    pub artifact_extensions: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            script_file_name: default_script_file_name(),
            timeout_seconds: default_timeout_seconds(),
            stability_poll_interval_ms: default_stability_poll_interval_ms(),
            stability_max_wait_ms: default_stability_max_wait_ms(),
            output_drain_ms: default_output_drain_ms(),
            artifact_extensions: default_artifact_extensions(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn stability_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stability_poll_interval_ms)
    }

    pub fn stability_max_wait(&self) -> Duration {
        Duration::from_millis(self.stability_max_wait_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    pub fn is_interesting(&self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|value| value.to_str()) else {
            return false;
        };
        self.artifact_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interpreter.trim().is_empty() {
            return Err("`sandbox.interpreter` must be non-empty".to_string());
        }
        let script = Path::new(&self.script_file_name);
        if self.script_file_name.trim().is_empty()
            || script.components().count() != 1
            || script.file_name().is_none()
        {
            return Err(
                "`sandbox.script_file_name` must be a plain file name without directories"
                    .to_string(),
            );
        }
        if self.timeout_seconds == 0 {
            return Err("`sandbox.timeout_seconds` must be greater than zero".to_string());
        }
        if self.stability_poll_interval_ms == 0 {
            return Err(
                "`sandbox.stability_poll_interval_ms` must be greater than zero".to_string(),
            );
        }
        if self.stability_max_wait_ms < self.stability_poll_interval_ms {
            return Err(
                "`sandbox.stability_max_wait_ms` must be at least one poll interval".to_string(),
            );
        }
        Ok(())
    }
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_script_file_name() -> String {
    "generated_script.py".to_string()
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_stability_poll_interval_ms() -> u64 {
    500
}

fn default_stability_max_wait_ms() -> u64 {
    10_000
}

fn default_output_drain_ms() -> u64 {
    500
}

fn default_artifact_extensions() -> Vec<String> {
    DEFAULT_ARTIFACT_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Messages emitted by the sandbox itself, such as artifact warnings.
    Notice,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
            OutputStream::Notice => write!(f, "sandbox"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    /// Raw line including its trailing newline, if the child wrote one.
    pub text: String,
}

impl OutputLine {
    pub fn trimmed(&self) -> &str {
        self.text.trim_end_matches(['\n', '\r'])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// False when the size was still changing at the end of the wait bound.
    pub stable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxFailure {
    Timeout,
    WriteFailed,
    LaunchFailed,
    Internal,
    NonZeroExit(i32),
}

impl std::fmt::Display for SandboxFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxFailure::Timeout => write!(f, "script timed out"),
            SandboxFailure::WriteFailed => write!(f, "script file could not be written"),
            SandboxFailure::LaunchFailed => write!(f, "script process could not be launched"),
            SandboxFailure::Internal => write!(f, "script supervision failed"),
            SandboxFailure::NonZeroExit(code) => write!(f, "script exited with code {code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: Vec<ArtifactFile>,
    pub script_path: PathBuf,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn failure(&self) -> Option<SandboxFailure> {
        match self.exit_code {
            0 => None,
            EXIT_TIMEOUT => Some(SandboxFailure::Timeout),
            EXIT_WRITE_FAILED => Some(SandboxFailure::WriteFailed),
            EXIT_LAUNCH_FAILED => Some(SandboxFailure::LaunchFailed),
            code if code < 0 => Some(SandboxFailure::Internal),
            code => Some(SandboxFailure::NonZeroExit(code)),
        }
    }

    pub fn artifact_paths(&self) -> Vec<PathBuf> {
        self.artifacts.iter().map(|a| a.path.clone()).collect()
    }

    pub fn stable_artifacts(&self) -> impl Iterator<Item = &ArtifactFile> {
        self.artifacts.iter().filter(|a| a.stable)
    }
}
