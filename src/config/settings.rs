use super::ConfigError;
use crate::pipeline::Stage;
use crate::runtime::{default_state_root_path, StatePaths};
use crate::sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScriptsConfig {
    #[serde(default = "default_create_script_file")]
    pub create_script_file: String,
    #[serde(default = "default_insert_script_file")]
    pub insert_script_file: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            create_script_file: default_create_script_file(),
            insert_script_file: default_insert_script_file(),
        }
    }
}

fn default_create_script_file() -> String {
    "create_Database_Script.py".to_string()
}

fn default_insert_script_file() -> String {
    "insert_Data_Script.py".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    pub workspaces_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_root: Option<PathBuf>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Script run for a stage, in place of the built-in behaviour.
    #[serde(default)]
    pub stages: BTreeMap<Stage, PathBuf>,
    #[serde(default)]
    pub scripts: ScriptsConfig,
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workspaces_path.is_absolute() {
            return Err(ConfigError::Settings(
                "`workspaces_path` must be an absolute path".to_string(),
            ));
        }
        if let Some(state_root) = &self.state_root {
            if !state_root.is_absolute() {
                return Err(ConfigError::Settings(
                    "`state_root` must be an absolute path".to_string(),
                ));
            }
        }
        self.sandbox.validate().map_err(ConfigError::Settings)?;

        for (stage, script) in &self.stages {
            if stage.is_terminal() {
                return Err(ConfigError::Settings(format!(
                    "`stages.{stage}` is terminal and cannot run a script"
                )));
            }
            if !script.is_absolute() {
                return Err(ConfigError::Settings(format!(
                    "`stages.{stage}` must be an absolute path"
                )));
            }
        }

        for (key, file_name) in [
            ("create_script_file", &self.scripts.create_script_file),
            ("insert_script_file", &self.scripts.insert_script_file),
        ] {
            let path = Path::new(file_name);
            if file_name.trim().is_empty() || path.components().count() != 1 {
                return Err(ConfigError::Settings(format!(
                    "`scripts.{key}` must be a plain file name"
                )));
            }
        }
        Ok(())
    }

    pub fn state_paths(&self) -> Result<StatePaths, ConfigError> {
        match &self.state_root {
            Some(root) => Ok(StatePaths::new(root)),
            None => default_state_root_path()
                .map(StatePaths::new)
                .map_err(|_| ConfigError::HomeDirectoryUnavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Settings {
        serde_yaml::from_str(raw).expect("parse settings")
    }

    #[test]
    fn minimal_settings_fill_defaults() {
        let settings = parse("workspaces_path: /tmp/run_space\n");
        assert_eq!(settings.sandbox, SandboxConfig::default());
        assert_eq!(settings.scripts, ScriptsConfig::default());
        assert!(settings.stages.is_empty());
        settings.validate().expect("valid");
    }

    #[test]
    fn stage_scripts_are_keyed_by_stage_name() {
        let settings = parse(
            r#"
workspaces_path: /tmp/run_space
stages:
  generate_model: /opt/scripts/model.py
  generate_create_script: /opt/scripts/create.py
"#,
        );
        assert_eq!(
            settings.stages.get(&Stage::GenerateModel),
            Some(&PathBuf::from("/opt/scripts/model.py"))
        );
        settings.validate().expect("valid");
    }

    #[test]
    fn relative_paths_and_terminal_stages_are_rejected() {
        let relative = parse("workspaces_path: run_space\n");
        assert!(matches!(
            relative.validate(),
            Err(ConfigError::Settings(message)) if message.contains("workspaces_path")
        ));

        let terminal = parse(
            r#"
workspaces_path: /tmp/run_space
stages:
  completed: /opt/scripts/done.py
"#,
        );
        assert!(terminal.validate().is_err());

        let nested_script = parse(
            r#"
workspaces_path: /tmp/run_space
scripts:
  create_script_file: ../create.py
"#,
        );
        assert!(nested_script.validate().is_err());
    }

    #[test]
    fn explicit_state_root_wins() {
        let settings = parse("workspaces_path: /tmp/run_space\nstate_root: /tmp/state\n");
        assert_eq!(
            settings.state_paths().expect("paths"),
            StatePaths::new("/tmp/state")
        );
    }
}
