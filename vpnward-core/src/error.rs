//! Error types for the vpnward VPN supervisor
//!
//! Connection attempts report their outcome as data (`ConnectionResult`).
//! These types cover the places that do return `Result`: configuration,
//! check-mode commands and process launch.

use thiserror::Error;

/// Main error type for the vpnward application
#[derive(Error, Debug)]
pub enum WardenError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The tunnel client could not be started
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Failures of a command executed in check mode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Non-zero exit. `hint` is set when the output looks like a sudo prompt.
    #[error("{label} failed rc={exit_code}{}\n{output}", render_hint(.hint))]
    Failed {
        label: String,
        exit_code: i32,
        output: String,
        hint: Option<String>,
    },

    #[error("{label} timed out\n{output}")]
    TimedOut { label: String, output: String },

    #[error("{label} could not be started: {reason}")]
    Spawn { label: String, reason: String },
}

fn render_hint(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!("\n{}", hint),
        None => String::new(),
    }
}

/// Tunnel client launch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Failed to spawn tunnel client: {reason}")]
    SpawnFailed { reason: String },

    #[error("Tunnel client output stream was not captured")]
    OutputNotCaptured,

    #[error("Empty command line")]
    EmptyCommand,

    #[error("Missing {what} path")]
    MissingPath { what: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, WardenError>;
