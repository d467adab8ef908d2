//! CLI configuration loading.

use anyhow::{Context, Result};
use cipherscope_core::Config;
use std::path::{Path, PathBuf};

/// Load the service configuration.
///
/// Precedence, highest first:
/// 1. `--data-dir`
/// 2. Environment variables (`CIPHERSCOPE_DATA_DIR`, `CIPHERSCOPE_LOG_LEVEL`)
/// 3. `--config`, `$CIPHERSCOPE_CONFIG` or `./cipherscope.toml`
/// 4. Defaults, with data kept under the user's local data directory
pub fn load_config(explicit: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::discover(explicit).context("Failed to load configuration")?;

    if let Some(dir) = data_dir {
        config.storage.data_dir = Some(dir);
    }
    if config.storage.data_dir.is_none() {
        config.storage.data_dir = default_data_dir();
    }
    Ok(config)
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("cipherscope"))
}
