//! Cleanup, probe and snapshot commands

use crate::cli::{print_failure, print_ok};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use vpnward_core::config::SupervisorConfig;
use vpnward_core::error::WardenError;
use vpnward_core::network::{NetworkProbe, SystemNetworkProbe};
use vpnward_core::process::SystemCommandRunner;
use vpnward_core::vpn::{Cleanup, SystemCleanup};

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Only check TCP reachability, not the route through the tunnel
    #[arg(long)]
    pub no_route_check: bool,

    /// Seconds allowed for the probe (defaults to the configured probe timeout)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,
}

fn runner(config: &SupervisorConfig) -> Arc<SystemCommandRunner> {
    Arc::new(SystemCommandRunner::new(config.elevation))
}

pub async fn run_cleanup(config: &SupervisorConfig) -> Result<i32, WardenError> {
    let cleanup = SystemCleanup::new(runner(config), config);
    let outcome = cleanup.cleanup(config.verbose).await;

    if outcome.ok {
        print_ok(&outcome.reason);
        Ok(0)
    } else {
        print_failure(&outcome.reason);
        Ok(1)
    }
}

pub async fn run_probe(config: &SupervisorConfig, args: &ProbeArgs) -> Result<i32, WardenError> {
    let timeout = match args.timeout {
        Some(secs) => Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO),
        None => config.probe_timeout(),
    };
    let probe = SystemNetworkProbe::new(runner(config));
    let outcome = probe.internet_probe(!args.no_route_check, timeout).await;

    if !outcome.ok {
        print_failure(&outcome.reason);
        return Ok(1);
    }

    print_ok(&outcome.reason);
    if config.log_public_ip {
        match probe.public_ip().await {
            Some(ip) => println!("Exit IP: {}", ip),
            None => println!("Exit IP: unknown"),
        }
    }
    Ok(0)
}

pub async fn run_snapshot(config: &SupervisorConfig) -> Result<i32, WardenError> {
    SystemNetworkProbe::new(runner(config))
        .snapshot("manual")
        .await;
    Ok(0)
}
