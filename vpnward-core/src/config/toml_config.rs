//! TOML configuration file I/O
//!
//! Handles loading and saving supervisor configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::SupervisorConfig;
use crate::error::{ConfigError, WardenError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/vpnward, or VPNWARD_CONFIG_DIR if set. When running
/// under sudo, the invoking user's home directory is used.
pub fn get_config_dir() -> Result<PathBuf, WardenError> {
    if let Ok(config_dir) = std::env::var("VPNWARD_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        std::env::var("SUDO_HOME").unwrap_or_else(|_| format!("/home/{}", sudo_user))
    } else {
        std::env::var("HOME").map_err(|_| {
            WardenError::Config(ConfigError::IoError {
                message: "HOME environment variable not set".to_string(),
            })
        })?
    };

    Ok(PathBuf::from(home).join(".config").join("vpnward"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, WardenError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the configuration from the default location
///
/// A missing file is not an error: defaults are returned instead.
pub fn load_config() -> Result<SupervisorConfig, WardenError> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        debug!("No configuration at {:?}, using defaults", config_path);
        return Ok(SupervisorConfig::default());
    }
    load_config_from_path(&config_path)
}

/// Load the configuration from a specific TOML file
pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<SupervisorConfig, WardenError> {
    let contents = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => WardenError::Config(ConfigError::LoadFailed {
            path: path.as_ref().to_string_lossy().to_string(),
        }),
        _ => WardenError::Config(ConfigError::IoError {
            message: format!("Failed to read config file: {}", e),
        }),
    })?;

    let config: SupervisorConfig = toml::from_str(&contents)?;

    config
        .validate()
        .map_err(|e| WardenError::Config(ConfigError::ValidationError { message: e }))?;

    info!(
        "Loaded configuration: init_timeout={}s, probe_timeout={}s, probe_enabled={}, client={}, elevation={}",
        config.init_timeout_secs,
        config.probe_timeout_secs,
        config.probe_enabled,
        config.client_binary,
        config.elevation.as_str()
    );

    Ok(config)
}

/// Save the configuration to a specific TOML file
pub fn save_config_to_path<P: AsRef<Path>>(
    config: &SupervisorConfig,
    path: P,
) -> Result<(), WardenError> {
    config
        .validate()
        .map_err(|e| WardenError::Config(ConfigError::ValidationError { message: e }))?;

    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            WardenError::Config(ConfigError::IoError {
                message: format!("Failed to create config directory: {}", e),
            })
        })?;
    }

    let contents = toml::to_string_pretty(config)?;

    std::fs::write(&path, contents).map_err(|_e| {
        WardenError::Config(ConfigError::SaveFailed {
            path: path.as_ref().to_string_lossy().to_string(),
        })
    })?;

    info!("Saved configuration to {:?}", path.as_ref());
    Ok(())
}
