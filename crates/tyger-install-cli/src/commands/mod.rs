pub mod install;
pub mod uninstall;
pub mod validate;

use colored::Colorize;
use std::path::Path;
use tyger_install::{CloudEnvironmentConfig, Result, quick_validate};

/// Load and validate a configuration file, filling in defaults
pub fn load_config(file: &Path) -> Result<CloudEnvironmentConfig> {
    let mut config = CloudEnvironmentConfig::load(file)?;
    quick_validate(&mut config)?;
    tracing::debug!("Loaded {}", file.display().to_string().cyan());
    Ok(config)
}
