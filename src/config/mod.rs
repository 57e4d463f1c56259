pub mod error;
pub mod load;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::load_settings;
pub use paths::{default_global_config_path, GLOBAL_SETTINGS_FILE_NAME};
pub use settings::{ScriptsConfig, Settings};
