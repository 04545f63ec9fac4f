//! Connect command
//!
//! Runs one supervised connect attempt and, on success, holds the tunnel
//! until Ctrl+C or until the client dies, then tears it down.

use crate::cli::{print_failure, print_ok};
use chrono::Local;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use vpnward_core::config::SupervisorConfig;
use vpnward_core::error::{ConfigError, WardenError};
use vpnward_core::vpn::{ConnectRequest, LaunchSpec, SupervisedProcess, Supervisor};

/// How often a held tunnel is checked for a dead client
const HOLD_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// OpenVPN configuration file
    #[arg(long, value_name = "PATH")]
    pub ovpn: PathBuf,

    /// Credentials file passed to --auth-user-pass
    #[arg(long, value_name = "PATH")]
    pub auth: PathBuf,

    /// Seconds to wait for the client to report initialization
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Seconds to keep probing the tunnel after initialization
    #[arg(long, value_name = "SECS")]
    pub probe_timeout: Option<f64>,

    /// Trust the client's initialization message without probing
    #[arg(long)]
    pub no_probe: bool,

    /// Skip the cleanup before launching
    #[arg(long)]
    pub no_pre_cleanup: bool,

    /// Extra client arguments, after `--`
    #[arg(last = true, value_name = "CLIENT_ARGS")]
    pub extra: Vec<String>,
}

impl ConnectArgs {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut SupervisorConfig) {
        if let Some(timeout) = self.timeout {
            config.init_timeout_secs = timeout;
        }
        if let Some(probe_timeout) = self.probe_timeout {
            config.probe_timeout_secs = probe_timeout;
        }
        if self.no_probe {
            config.probe_enabled = false;
        }
        if self.no_pre_cleanup {
            config.pre_cleanup = false;
        }
    }

    pub fn request(&self) -> ConnectRequest {
        ConnectRequest::new(&self.ovpn, &self.auth).with_extra_args(self.extra.clone())
    }
}

/// How a held connection ended
enum HoldEnd {
    Interrupted,
    ClientExited(i32),
}

pub async fn run_connect(mut config: SupervisorConfig, args: &ConnectArgs) -> Result<i32, WardenError> {
    args.apply(&mut config);
    config
        .validate()
        .map_err(|message| WardenError::Config(ConfigError::ValidationError { message }))?;

    let request = args.request();
    // Reject unusable paths before touching the system
    LaunchSpec::new(&config, &request)?;

    println!(
        "{} Connecting with {}",
        "→".cyan().bold(),
        args.ovpn.display()
    );

    let mut supervisor = Supervisor::system(config);
    let result = supervisor.connect(&request).await;
    let reason = result.reason().to_string();

    let Some(mut process) = result.into_process() else {
        print_failure(&format!("Connection failed: {}", reason));
        return Ok(1);
    };

    let connected_at = Local::now();
    print_ok(&format!(
        "Connected ({}) at {}",
        reason,
        connected_at.format("%Y-%m-%d %H:%M:%S")
    ));
    println!("Press Ctrl+C to disconnect");

    let end = hold(&mut process).await;
    if let HoldEnd::ClientExited(rc) = end {
        print_failure(&format!(
            "Tunnel client exited unexpectedly (rc={})\n{}",
            rc,
            process.tail()
        ));
    }

    println!("{} Disconnecting...", "→".cyan().bold());
    let rc = supervisor.teardown(process).await;
    let uptime = Local::now().signed_duration_since(connected_at);
    print_ok(&format!(
        "Disconnected after {} (client rc={})",
        format_uptime(uptime.num_seconds()),
        rc
    ));

    Ok(match end {
        HoldEnd::Interrupted => 0,
        HoldEnd::ClientExited(_) => 1,
    })
}

async fn hold(process: &mut SupervisedProcess) -> HoldEnd {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(HOLD_POLL_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                return HoldEnd::Interrupted;
            }
            _ = ticker.tick() => {
                if let Some(rc) = process.try_exit_code() {
                    return HoldEnd::ClientExited(rc);
                }
            }
        }
    }
}

fn format_uptime(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
