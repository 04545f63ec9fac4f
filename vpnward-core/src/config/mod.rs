//! Configuration module
//!
//! Supervisor timing, launch and diagnostics settings, loadable from TOML.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod toml_config;

/// How privileged commands are elevated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// `sudo -n`: fail immediately instead of prompting for a password
    #[default]
    Sudo,
    /// Run commands as-is (already root, or tests)
    None,
}

impl Elevation {
    /// Command prefix that elevates the following argv
    pub fn prefix(&self) -> Vec<String> {
        match self {
            Elevation::Sudo => {
                let sudo = which::which("sudo")
                    .map(|path| path.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "sudo".to_string());
                vec![sudo, "-n".to_string()]
            }
            Elevation::None => Vec::new(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Elevation::Sudo => "sudo",
            Elevation::None => "none",
        }
    }
}

/// Supervisor configuration
///
/// Every field has a default, so an empty TOML file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds to wait for the marker line after launch
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: f64,

    /// Seconds to keep probing the tunnel after the marker line
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: f64,

    /// Verify routing and reachability after initialization
    #[serde(default = "default_true")]
    pub probe_enabled: bool,

    /// Grace period after SIGINT before escalating
    #[serde(default = "default_sigint_grace")]
    pub sigint_grace_secs: f64,

    /// Grace period after SIGTERM before escalating
    #[serde(default = "default_sigterm_grace")]
    pub sigterm_grace_secs: f64,

    /// Supervisor polling interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Pause between failed probes
    #[serde(default = "default_probe_retry_interval")]
    pub probe_retry_interval_ms: u64,

    /// Number of client output lines kept for diagnostics
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Substring the client prints once its tunnel is up
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Run the cleanup routine before launching
    #[serde(default = "default_true")]
    pub pre_cleanup: bool,

    /// Check that non-interactive elevation works before touching the system
    #[serde(default = "default_true")]
    pub verify_elevation: bool,

    /// Echo client output and take network snapshots at DEBUG level
    #[serde(default)]
    pub verbose: bool,

    /// Log the public exit IP before and after connecting
    #[serde(default = "default_true")]
    pub log_public_ip: bool,

    /// Tunnel client binary
    #[serde(default = "default_client_binary")]
    pub client_binary: String,

    /// Arguments inserted between the client binary and the fixed argument template
    #[serde(default)]
    pub client_prefix_args: Vec<String>,

    /// Privilege elevation mechanism
    #[serde(default)]
    pub elevation: Elevation,

    /// Arguments appended after the fixed argument template
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_init_timeout() -> f64 {
    25.0
}
fn default_probe_timeout() -> f64 {
    8.0
}
fn default_sigint_grace() -> f64 {
    5.0
}
fn default_sigterm_grace() -> f64 {
    3.0
}
fn default_poll_interval() -> u64 {
    50
}
fn default_probe_retry_interval() -> u64 {
    250
}
fn default_tail_lines() -> usize {
    300
}
fn default_marker() -> String {
    "Initialization Sequence Completed".to_string()
}
fn default_client_binary() -> String {
    "openvpn".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            probe_enabled: true,
            sigint_grace_secs: default_sigint_grace(),
            sigterm_grace_secs: default_sigterm_grace(),
            poll_interval_ms: default_poll_interval(),
            probe_retry_interval_ms: default_probe_retry_interval(),
            tail_lines: default_tail_lines(),
            marker: default_marker(),
            pre_cleanup: true,
            verify_elevation: true,
            verbose: false,
            log_public_ip: true,
            client_binary: default_client_binary(),
            client_prefix_args: Vec::new(),
            elevation: Elevation::default(),
            extra_args: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let timeouts = [
            ("init_timeout_secs", self.init_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("sigint_grace_secs", self.sigint_grace_secs),
            ("sigterm_grace_secs", self.sigterm_grace_secs),
        ];
        for (name, value) in timeouts {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{} must be a positive number of seconds", name));
            }
        }

        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms cannot be zero".to_string());
        }

        if self.tail_lines == 0 {
            return Err("tail_lines cannot be zero".to_string());
        }

        if self.marker.is_empty() {
            return Err("marker cannot be empty".to_string());
        }

        if self.client_binary.trim().is_empty() {
            return Err("client_binary cannot be empty".to_string());
        }

        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        secs(self.init_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout_secs)
    }

    pub fn sigint_grace(&self) -> Duration {
        secs(self.sigint_grace_secs)
    }

    pub fn sigterm_grace(&self) -> Duration {
        secs(self.sigterm_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_retry_interval(&self) -> Duration {
        Duration::from_millis(self.probe_retry_interval_ms)
    }

    /// Name used to find stray client processes during cleanup
    pub fn client_process_name(&self) -> String {
        std::path::Path::new(&self.client_binary)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.client_binary.clone())
    }
}

/// Seconds to `Duration`; negative or non-finite input becomes zero
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SupervisorConfig::default();
        assert_eq!(config.init_timeout(), Duration::from_secs(25));
        assert_eq!(config.probe_timeout(), Duration::from_secs(8));
        assert_eq!(config.sigint_grace(), Duration::from_secs(5));
        assert_eq!(config.sigterm_grace(), Duration::from_secs(3));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.tail_lines, 300);
        assert_eq!(config.marker, "Initialization Sequence Completed");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_validation() {
        let mut negative = SupervisorConfig::default();
        negative.init_timeout_secs = -1.0;

        let mut nan = SupervisorConfig::default();
        nan.sigterm_grace_secs = f64::NAN;

        let mut zero_poll = SupervisorConfig::default();
        zero_poll.poll_interval_ms = 0;

        let mut empty_marker = SupervisorConfig::default();
        empty_marker.marker = String::new();

        for config in [negative, nan, zero_poll, empty_marker] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_secs_never_panics() {
        assert_eq!(secs(-3.0), Duration::ZERO);
        assert_eq!(secs(f64::INFINITY), Duration::ZERO);
        assert_eq!(secs(0.05), Duration::from_millis(50));
    }

    #[test]
    fn test_client_process_name_strips_directories() {
        let mut config = SupervisorConfig::default();
        config.client_binary = "/usr/local/sbin/openvpn".to_string();
        assert_eq!(config.client_process_name(), "openvpn");
    }

    #[test]
    fn test_elevation_prefix() {
        assert!(Elevation::None.prefix().is_empty());
        let sudo = Elevation::Sudo.prefix();
        assert_eq!(sudo.len(), 2);
        assert!(sudo[0].ends_with("sudo"));
        assert_eq!(sudo[1], "-n");
    }
}
