//! vpnward - OpenVPN connection supervisor
//!
//! Launches an OpenVPN client through non-interactive sudo, verifies that
//! traffic really goes through the tunnel and always reverts routes and DNS
//! state when the connection fails or ends.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vpnward_core::{
    config::{toml_config, SupervisorConfig},
    error::WardenError,
    init_logging,
};

mod cli;

#[derive(Parser, Debug)]
#[command(name = "vpnward")]
#[command(about = "Supervise an OpenVPN client and verify the tunnel carries traffic")]
struct Cli {
    /// Load supervisor settings from this TOML file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging, client output echo and network snapshots
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and hold the tunnel until Ctrl+C
    Connect(cli::connect::ConnectArgs),
    /// Kill stray clients, reset DNS and remove split-default routes
    Cleanup,
    /// Check that traffic is routed through a tunnel and reaches the internet
    Probe(cli::maintenance::ProbeArgs),
    /// Log routing, proxy and DNS state
    Snapshot,
}

fn load_settings(cli: &Cli) -> Result<SupervisorConfig, WardenError> {
    let mut config = match &cli.config {
        Some(path) => toml_config::load_config_from_path(path)?,
        None => toml_config::load_config()?,
    };
    if cli.verbose {
        config.verbose = true;
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<i32, WardenError> {
    let config = load_settings(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match &cli.command {
            Commands::Connect(args) => cli::connect::run_connect(config, args).await,
            Commands::Cleanup => cli::maintenance::run_cleanup(&config).await,
            Commands::Probe(args) => cli::maintenance::run_probe(&config, args).await,
            Commands::Snapshot => cli::maintenance::run_snapshot(&config).await,
        }
    })
}

fn main() {
    let cli = Cli::parse();

    // Snapshots are logged at DEBUG, so that command always logs verbosely
    let verbose = cli.verbose || matches!(cli.command, Commands::Snapshot);
    if let Err(e) = init_logging(verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let exit_code = match e {
                // Configuration errors (exit code 2)
                WardenError::Config(_) | WardenError::Toml(_) | WardenError::TomlSerialize(_) => 2,
                // Runtime errors (exit code 1)
                WardenError::Launch(_) | WardenError::Io(_) => 1,
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}
