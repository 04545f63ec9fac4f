//! Error display formats

use vpnward_core::error::{CommandError, ConfigError, LaunchError, WardenError};
use vpnward_core::process::CommandOutput;

#[test]
fn test_command_failure_display_includes_hint_and_output() {
    let err = CommandOutput::exited(1, "sudo: a terminal is required to read the password\n")
        .check("cleanup-preflight")
        .unwrap_err();

    let text = err.to_string();
    assert!(text.starts_with("cleanup-preflight failed rc=1\nLikely cause:"));
    assert!(text.ends_with("a terminal is required to read the password\n"));
}

#[test]
fn test_timeout_display_keeps_partial_output() {
    let err = CommandOutput::timed_out("partial").check("dns").unwrap_err();
    assert_eq!(err.to_string(), "dns timed out\npartial\n[TIMEOUT]\n");
}

#[test]
fn test_spawn_failure_display() {
    let err = CommandError::Spawn {
        label: "route-get".to_string(),
        reason: "No such file or directory".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "route-get could not be started: No such file or directory"
    );
}

#[test]
fn test_conversions_into_top_level_error() {
    let err: WardenError = ConfigError::ValidationError {
        message: "marker cannot be empty".to_string(),
    }
    .into();
    assert_eq!(
        err.to_string(),
        "Configuration error: Configuration validation error: marker cannot be empty"
    );

    let err: WardenError = LaunchError::MissingPath {
        what: "credentials".to_string(),
    }
    .into();
    assert_eq!(err.to_string(), "Launch error: Missing credentials path");
}
