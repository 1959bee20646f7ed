pub mod profiles;
pub mod settings;

pub use profiles::*;
pub use settings::*;

use crate::error::AppResult;
use std::path::PathBuf;

/// Get the sshbridge config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| crate::error::AppError::Config("Could not find config directory".into()))?
        .join("sshbridge");

    Ok(config_dir)
}
