use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::ConfigError;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "ember";
pub const APP_NAME: &str = "lifecycle";

pub const DATA_DIR_ENV: &str = "EMBER_DATA_DIR";

pub fn data_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn database_path() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("ember.db"))
}

pub fn exports_dir() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("exports"))
}

pub fn outbox_dir() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("outbox"))
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("config.json"))
}
