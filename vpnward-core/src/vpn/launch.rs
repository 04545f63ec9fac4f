//! Tunnel client command line
//!
//! The client always runs through non-interactive elevation with a fixed,
//! auditable argument template. Caller-supplied arguments go last.

use crate::config::SupervisorConfig;
use crate::error::LaunchError;
use crate::process::runner::quote_argv;
use crate::process::ManagedChild;
use std::path::PathBuf;

/// Keepalive ping interval passed to the client, in seconds
pub const PING_INTERVAL_SECS: u32 = 10;

/// Restart threshold after missed pings, in seconds
pub const PING_RESTART_SECS: u32 = 30;

/// Client log verbosity
pub const VERBOSITY: u32 = 3;

/// What the server-selection layer hands to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Client configuration file
    pub config_path: PathBuf,
    /// Credentials file
    pub auth_path: PathBuf,
    /// Appended after the configured extra arguments
    pub extra_args: Vec<String>,
}

impl ConnectRequest {
    pub fn new(config_path: impl Into<PathBuf>, auth_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            auth_path: auth_path.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }
}

/// Fully resolved client command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    argv: Vec<String>,
}

impl LaunchSpec {
    pub fn new(config: &SupervisorConfig, request: &ConnectRequest) -> Result<Self, LaunchError> {
        let config_path = path_arg(&request.config_path, "configuration")?;
        let auth_path = path_arg(&request.auth_path, "credentials")?;

        let mut argv = config.elevation.prefix();
        argv.push(config.client_binary.clone());
        argv.extend(config.client_prefix_args.iter().cloned());
        argv.extend(client_args(&config_path, &auth_path));
        argv.extend(config.extra_args.iter().cloned());
        argv.extend(request.extra_args.iter().cloned());

        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn display(&self) -> String {
        quote_argv(&self.argv)
    }

    /// Start the client as a new process-group leader
    pub fn spawn(&self) -> Result<ManagedChild, LaunchError> {
        ManagedChild::spawn(&self.argv)
    }
}

/// The fixed client argument template
pub fn client_args(config_path: &str, auth_path: &str) -> Vec<String> {
    vec![
        "--config".to_string(),
        config_path.to_string(),
        "--auth-user-pass".to_string(),
        auth_path.to_string(),
        "--auth-nocache".to_string(),
        "--verb".to_string(),
        VERBOSITY.to_string(),
        "--ping".to_string(),
        PING_INTERVAL_SECS.to_string(),
        "--ping-restart".to_string(),
        PING_RESTART_SECS.to_string(),
    ]
}

fn path_arg(path: &std::path::Path, what: &str) -> Result<String, LaunchError> {
    if path.as_os_str().is_empty() {
        return Err(LaunchError::MissingPath {
            what: what.to_string(),
        });
    }
    Ok(path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Elevation;

    #[test]
    fn test_argv_order() {
        let mut config = SupervisorConfig::default();
        config.elevation = Elevation::None;
        config.extra_args = vec!["--route-nopull".to_string()];
        let request = ConnectRequest::new("/etc/vpn/se-12.ovpn", "/tmp/auth.txt")
            .with_extra_args(vec!["--dev".to_string(), "tun3".to_string()]);

        let spec = LaunchSpec::new(&config, &request).unwrap();

        assert_eq!(
            spec.argv(),
            [
                "openvpn",
                "--config",
                "/etc/vpn/se-12.ovpn",
                "--auth-user-pass",
                "/tmp/auth.txt",
                "--auth-nocache",
                "--verb",
                "3",
                "--ping",
                "10",
                "--ping-restart",
                "30",
                "--route-nopull",
                "--dev",
                "tun3",
            ]
        );
    }

    #[test]
    fn test_sudo_prefix_comes_first() {
        let config = SupervisorConfig::default();
        let spec = LaunchSpec::new(&config, &ConnectRequest::new("a.ovpn", "auth")).unwrap();

        assert!(spec.argv()[0].ends_with("sudo"));
        assert_eq!(spec.argv()[1], "-n");
        assert_eq!(spec.argv()[2], "openvpn");
    }

    #[test]
    fn test_prefix_args_precede_template() {
        let mut config = SupervisorConfig::default();
        config.elevation = Elevation::None;
        config.client_binary = "sh".to_string();
        config.client_prefix_args = vec!["-c".to_string(), "exit 0".to_string()];

        let spec = LaunchSpec::new(&config, &ConnectRequest::new("a b.ovpn", "auth")).unwrap();

        assert_eq!(&spec.argv()[..3], ["sh", "-c", "exit 0"]);
        assert!(spec.display().starts_with("sh -c 'exit 0' --config 'a b.ovpn'"));
    }

    #[test]
    fn test_empty_paths_are_rejected() {
        let config = SupervisorConfig::default();
        let result = LaunchSpec::new(&config, &ConnectRequest::new("", "auth"));
        assert_eq!(
            result.unwrap_err(),
            LaunchError::MissingPath {
                what: "configuration".to_string()
            }
        );
    }
}
