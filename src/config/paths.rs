use crate::config::ConfigError;
use crate::runtime::DEFAULT_STATE_ROOT_DIR;
use std::path::PathBuf;

pub const GLOBAL_SETTINGS_FILE_NAME: &str = "config.yaml";

pub fn default_global_config_path() -> Result<PathBuf, ConfigError> {
    let home = std::env::var_os("HOME").ok_or(ConfigError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home)
        .join(DEFAULT_STATE_ROOT_DIR)
        .join(GLOBAL_SETTINGS_FILE_NAME))
}
