//! Best-effort reconciliation of OS network state
//!
//! Kills stray tunnel clients by name, resets the DNS resolver and removes the
//! split-default routes. Every step runs regardless of how the previous one
//! went. Only the elevation preflight can make a cleanup fail.

use crate::config::{Elevation, SupervisorConfig};
use crate::network::platform::{PlatformCommands, CURRENT, SPLIT_DEFAULT_ROUTES};
use crate::network::probe::diagnostic_snapshot;
use crate::process::{CommandRequest, CommandRunner};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);
const PKILL_TIMEOUT: Duration = Duration::from_secs(3);
const PKILL_PAUSE: Duration = Duration::from_millis(200);
const DNS_TIMEOUT: Duration = Duration::from_secs(5);
const ROUTE_TIMEOUT: Duration = Duration::from_secs(3);
const SETTLE: Duration = Duration::from_millis(300);

/// Result of one cleanup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub ok: bool,
    pub reason: String,
}

impl CleanupOutcome {
    pub fn succeeded() -> Self {
        Self {
            ok: true,
            reason: "cleanup-ok".to_string(),
        }
    }

    pub fn failed(detail: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            reason: format!("cleanup-failed: {}", detail),
        }
    }
}

/// Idempotent network state cleanup
pub trait Cleanup: Send + Sync {
    /// Run every cleanup step; `verbose` adds a diagnostics snapshot afterwards
    fn cleanup(&self, verbose: bool) -> impl Future<Output = CleanupOutcome> + Send;
}

/// Cleanup through privileged OS commands
#[derive(Debug)]
pub struct SystemCleanup<R> {
    runner: Arc<R>,
    process_name: String,
    preflight: bool,
    platform: &'static PlatformCommands,
}

impl<R: CommandRunner> SystemCleanup<R> {
    pub fn new(runner: Arc<R>, config: &SupervisorConfig) -> Self {
        Self {
            runner,
            process_name: config.client_process_name(),
            preflight: config.verify_elevation && config.elevation != Elevation::None,
            platform: &CURRENT,
        }
    }

    /// Fail fast when privileged commands cannot run without a prompt
    async fn verify_elevation(&self) -> Result<(), crate::error::CommandError> {
        let request = CommandRequest::privileged(["true"])
            .with_timeout(PREFLIGHT_TIMEOUT)
            .with_label("cleanup-preflight");
        self.runner.run_checked(&request).await.map(|_| ())
    }

    async fn best_effort(&self, request: CommandRequest) {
        let output = self.runner.run(&request).await;
        if !output.success() {
            // pkill finding nothing and deleting absent routes land here
            debug!(
                label = request.label(),
                exit_code = output.exit_code,
                "Cleanup step did not succeed"
            );
        }
    }

    async fn kill_stray_clients(&self) {
        let name = self.process_name.as_str();
        self.best_effort(
            CommandRequest::privileged(["pkill", "-TERM", name])
                .with_timeout(PKILL_TIMEOUT)
                .with_label("cleanup-pkill-term"),
        )
        .await;
        tokio::time::sleep(PKILL_PAUSE).await;
        self.best_effort(
            CommandRequest::privileged(["pkill", "-KILL", name])
                .with_timeout(PKILL_TIMEOUT)
                .with_label("cleanup-pkill-kill"),
        )
        .await;
    }

    async fn reset_dns(&self) {
        self.best_effort(
            CommandRequest::privileged(self.platform.dns_flush.iter().copied())
                .with_timeout(DNS_TIMEOUT)
                .with_label("cleanup-dnsflush"),
        )
        .await;
        self.best_effort(
            CommandRequest::privileged(self.platform.dns_reload.iter().copied())
                .with_timeout(DNS_TIMEOUT)
                .with_label("cleanup-dnsreload"),
        )
        .await;
    }

    async fn delete_split_routes(&self) {
        for cidr in SPLIT_DEFAULT_ROUTES {
            self.best_effort(
                CommandRequest::privileged(self.platform.route_delete_argv(cidr))
                    .with_timeout(ROUTE_TIMEOUT)
                    .with_label(format!("cleanup-route-{}", cidr)),
            )
            .await;
        }
    }
}

impl<R: CommandRunner> Cleanup for SystemCleanup<R> {
    #[tracing::instrument(skip(self))]
    async fn cleanup(&self, verbose: bool) -> CleanupOutcome {
        if self.preflight {
            if let Err(e) = self.verify_elevation().await {
                warn!("Privileged commands unavailable: {}", e);
                return CleanupOutcome::failed(e);
            }
        }

        self.kill_stray_clients().await;
        self.reset_dns().await;
        self.delete_split_routes().await;
        tokio::time::sleep(SETTLE).await;

        if verbose {
            diagnostic_snapshot(self.runner.as_ref(), "post-cleanup").await;
        }

        info!("Network state cleaned up");
        CleanupOutcome::succeeded()
    }
}
