use super::{Stage, StageContext, StageError, StageHandler};
use std::fs;
use std::path::{Path, PathBuf};

fn read_script(path: &Path) -> Result<String, StageError> {
    fs::read_to_string(path).map_err(|err| StageError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

/// Runs a script that an earlier stage left in the working directory, such as
/// `create_Database_Script.py`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFileStage {
    file_name: String,
}

impl ScriptFileStage {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl StageHandler for ScriptFileStage {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Stage, StageError> {
        let path = ctx.path(&self.file_name);
        let source = read_script(&path)?;
        ctx.logger
            .system(format!("[engine] executing {}", path.display()));
        let result = ctx.run_script_checked(&source)?;
        ctx.logger.log(format!(
            "{} finished in {}ms",
            self.file_name, result.duration_ms
        ));
        ctx.default_next()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline(String),
    File(PathBuf),
}

/// Runs configured script text for a stage and moves on to the default
/// successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStage {
    source: ScriptSource,
}

impl CommandStage {
    pub fn inline(source_text: impl Into<String>) -> Self {
        Self {
            source: ScriptSource::Inline(source_text.into()),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ScriptSource::File(path.into()),
        }
    }

    pub fn source(&self) -> &ScriptSource {
        &self.source
    }
}

impl StageHandler for CommandStage {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Stage, StageError> {
        // Decide first so bad review feedback never runs the script.
        let next = ctx.default_next()?;
        let source = match &self.source {
            ScriptSource::Inline(text) => text.clone(),
            ScriptSource::File(path) => read_script(path)?,
        };
        ctx.run_script_checked(&source)?;
        Ok(next)
    }
}

/// Removes the sandbox's scratch script from the working directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStage;

impl StageHandler for CleanupStage {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Stage, StageError> {
        let scratch = ctx.sandbox.script_path(ctx.working_dir);
        match fs::remove_file(&scratch) {
            Ok(()) => ctx
                .logger
                .system(format!("[engine] removed {}", scratch.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StageError::Io {
                    path: scratch.display().to_string(),
                    message: err.to_string(),
                })
            }
        }
        ctx.default_next()
    }
}
