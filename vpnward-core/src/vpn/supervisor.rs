//! Connection supervisor
//!
//! Runs one connect attempt end to end:
//! PRE_CLEANUP -> LAUNCH -> WAIT_INIT -> POST_INIT_CHECK -> PROBE -> CONNECTED,
//! with FAILED reachable from every state. A failed attempt has already
//! stopped its process and cleaned up by the time it is reported.

use crate::config::SupervisorConfig;
use crate::error::LaunchError;
use crate::network::probe::{NetworkProbe, SystemNetworkProbe};
use crate::process::{stop, ManagedChild, StopGrace, StopSignal, SystemCommandRunner};
use crate::vpn::cleanup::{Cleanup, SystemCleanup};
use crate::vpn::launch::{ConnectRequest, LaunchSpec};
use crate::vpn::watcher::{Latch, OutputWatcher, WatcherOptions};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long to wait for a process whose output already closed to be reaped
pub const REAP_GRACE: Duration = Duration::from_millis(200);

/// Upper bound of a single probe attempt
pub const PROBE_ATTEMPT_CAP: Duration = Duration::from_secs(5);

/// Time allowed for the watcher to read the last lines of a dead process
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Supervisor states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// No attempt in progress
    Idle,
    PreCleanup,
    Launch,
    WaitInit,
    PostInitCheck,
    Probe,
    Connected,
    Failed,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectPhase::Idle => "IDLE",
            ConnectPhase::PreCleanup => "PRE_CLEANUP",
            ConnectPhase::Launch => "LAUNCH",
            ConnectPhase::WaitInit => "WAIT_INIT",
            ConnectPhase::PostInitCheck => "POST_INIT_CHECK",
            ConnectPhase::Probe => "PROBE",
            ConnectPhase::Connected => "CONNECTED",
            ConnectPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A running tunnel client owned by the caller
#[derive(Debug)]
pub struct SupervisedProcess {
    child: ManagedChild,
    watcher: OutputWatcher,
}

impl SupervisedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn pgid(&self) -> Option<u32> {
        self.child.pgid()
    }

    /// Most recent client output
    pub fn tail(&self) -> String {
        self.watcher.tail()
    }

    /// Exit code if the client has terminated
    pub fn try_exit_code(&mut self) -> Option<i32> {
        self.child.try_exit_code()
    }

    /// Exit code, also reaping a process whose output has already closed
    async fn exit_code(&mut self) -> Option<i32> {
        if let Some(code) = self.child.try_exit_code() {
            return Some(code);
        }
        if self.watcher.exited() {
            return self.child.wait_for_exit(REAP_GRACE).await;
        }
        None
    }
}

/// Outcome of one connect attempt
///
/// Carries a process if and only if the attempt succeeded.
#[derive(Debug)]
pub struct ConnectionResult {
    process: Option<SupervisedProcess>,
    reason: String,
}

impl ConnectionResult {
    fn connected(process: SupervisedProcess, reason: &str) -> Self {
        Self {
            process: Some(process),
            reason: reason.to_string(),
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            process: None,
            reason,
        }
    }

    pub fn ok(&self) -> bool {
        self.process.is_some()
    }

    /// Tag line, optionally followed by `\nTAIL:\n` and the client output
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// First line of the reason
    pub fn tag(&self) -> &str {
        self.reason.lines().next().unwrap_or_default()
    }

    pub fn process(&self) -> Option<&SupervisedProcess> {
        self.process.as_ref()
    }

    /// Take ownership of the live process; the caller must tear it down
    pub fn into_process(self) -> Option<SupervisedProcess> {
        self.process
    }
}

/// Why an attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    Launch(LaunchError),
    ExitedEarly { rc: i32 },
    TimeoutWaitingInit { final_rc: i32 },
    ExitedAfterInit { rc: i32 },
    DiedDuringProbe { rc: i32 },
    ProbeFailed { last_reason: String, final_rc: i32 },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Launch(e) => write!(f, "launch-failed: {}", e),
            Failure::ExitedEarly { rc } => write!(f, "openvpn-exited-early rc={}", rc),
            Failure::TimeoutWaitingInit { final_rc } => {
                write!(f, "timeout-waiting-init final_rc={}", final_rc)
            }
            Failure::ExitedAfterInit { rc } => write!(f, "exited-after-init rc={}", rc),
            Failure::DiedDuringProbe { rc } => write!(f, "died-during-probe rc={}", rc),
            Failure::ProbeFailed {
                last_reason,
                final_rc,
            } => write!(
                f,
                "init-seen-but-probe-failed: {}; stopped rc={}",
                last_reason, final_rc
            ),
        }
    }
}

fn with_tail(failure: &Failure, tail: &str) -> String {
    format!("{}\nTAIL:\n{}", failure, tail)
}

/// Drives connect attempts and teardowns
///
/// Runs at most one attempt at a time; nothing coordinates separate
/// supervisors sharing the host's routing table.
#[derive(Debug)]
pub struct Supervisor<P, C> {
    config: SupervisorConfig,
    probe: P,
    cleanup: C,
    phase: ConnectPhase,
}

/// Supervisor wired to real OS commands
pub type SystemSupervisor =
    Supervisor<SystemNetworkProbe<SystemCommandRunner>, SystemCleanup<SystemCommandRunner>>;

impl SystemSupervisor {
    pub fn system(config: SupervisorConfig) -> Self {
        let runner = Arc::new(SystemCommandRunner::new(config.elevation));
        let probe = SystemNetworkProbe::new(Arc::clone(&runner));
        let cleanup = SystemCleanup::new(runner, &config);
        Supervisor::new(config, probe, cleanup)
    }
}

impl<P: NetworkProbe, C: Cleanup> Supervisor<P, C> {
    pub fn new(config: SupervisorConfig, probe: P, cleanup: C) -> Self {
        Self {
            config,
            probe,
            cleanup,
            phase: ConnectPhase::Idle,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn cleanup(&self) -> &C {
        &self.cleanup
    }

    /// Current (or last terminal) state
    pub fn phase(&self) -> ConnectPhase {
        self.phase
    }

    fn enter(&mut self, phase: ConnectPhase) {
        debug!(from = %self.phase, to = %phase, "Supervisor state change");
        self.phase = phase;
    }

    fn grace(&self) -> StopGrace {
        StopGrace::from_config(&self.config)
    }

    /// Run one connect attempt
    #[tracing::instrument(skip_all, fields(config = %request.config_path.display()))]
    pub async fn connect(&mut self, request: &ConnectRequest) -> ConnectionResult {
        let verbose = self.config.verbose;

        if self.config.log_public_ip {
            if let Some(ip) = self.probe.public_ip().await {
                info!("Baseline exit IP: {}", ip);
            }
        }

        if self.config.pre_cleanup {
            self.enter(ConnectPhase::PreCleanup);
            let outcome = self.cleanup.cleanup(verbose).await;
            if !outcome.ok {
                error!("Pre-connect cleanup failed: {}", outcome.reason);
                if verbose {
                    self.probe.snapshot("cleanup-failed").await;
                }
                self.enter(ConnectPhase::Failed);
                return ConnectionResult::failed(outcome.reason);
            }
        }

        self.enter(ConnectPhase::Launch);
        let mut process = match self.launch(request).await {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to launch tunnel client: {}", e);
                self.cleanup.cleanup(false).await;
                self.enter(ConnectPhase::Failed);
                return ConnectionResult::failed(Failure::Launch(e).to_string());
            }
        };
        info!(pid = ?process.pid(), "Tunnel client started");

        self.enter(ConnectPhase::WaitInit);
        let deadline = Instant::now() + self.config.init_timeout();
        loop {
            if process.watcher.ready() {
                break;
            }
            if let Some(rc) = process.exit_code().await {
                // The marker may still be in the pipe behind the exit
                process.watcher.wait_exited(OUTPUT_DRAIN).await;
                if process.watcher.ready() {
                    break;
                }
                return self.abandon(process, Failure::ExitedEarly { rc }).await;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Initialization not reported within {:?}",
                    self.config.init_timeout()
                );
                let final_rc = stop(&mut process.child, self.grace()).await;
                return self
                    .abandon(process, Failure::TimeoutWaitingInit { final_rc })
                    .await;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }

        self.enter(ConnectPhase::PostInitCheck);
        if let Some(rc) = process.exit_code().await {
            return self.abandon(process, Failure::ExitedAfterInit { rc }).await;
        }

        if !self.config.probe_enabled {
            self.enter(ConnectPhase::Connected);
            info!("Tunnel client initialized (probe disabled)");
            return ConnectionResult::connected(process, "initialized");
        }

        self.enter(ConnectPhase::Probe);
        let probe_deadline = Instant::now() + self.config.probe_timeout();
        let mut last_reason = "probe-not-run".to_string();
        while Instant::now() < probe_deadline {
            if let Some(rc) = process.exit_code().await {
                return self.abandon(process, Failure::DiedDuringProbe { rc }).await;
            }

            let remaining = probe_deadline.saturating_duration_since(Instant::now());
            let outcome = self
                .probe
                .internet_probe(true, remaining.min(PROBE_ATTEMPT_CAP))
                .await;
            if outcome.ok {
                if self.config.log_public_ip {
                    if let Some(ip) = self.probe.public_ip().await {
                        info!("Tunnel exit IP: {}", ip);
                    }
                }
                self.enter(ConnectPhase::Connected);
                info!("Tunnel verified");
                return ConnectionResult::connected(process, "initialized+probe-ok");
            }

            debug!(reason = %outcome.reason, "Probe attempt failed");
            last_reason = outcome.reason;
            tokio::time::sleep(self.config.probe_retry_interval()).await;
        }

        warn!("Tunnel never verified: {}", last_reason);
        let final_rc = stop(&mut process.child, self.grace()).await;
        let result = self
            .abandon(
                process,
                Failure::ProbeFailed {
                    last_reason,
                    final_rc,
                },
            )
            .await;
        if verbose {
            self.probe.snapshot("probe-failed").await;
        }
        result
    }

    async fn launch(&self, request: &ConnectRequest) -> Result<SupervisedProcess, LaunchError> {
        let spec = LaunchSpec::new(&self.config, request)?;
        debug!(command = %spec.display(), "Launching tunnel client");

        let mut child = spec.spawn()?;
        let output = match child.take_output() {
            Ok(output) => output,
            Err(e) => {
                // Nothing may outlive a failed attempt
                if let Err(signal_error) = child.signal(StopSignal::Kill) {
                    warn!("Failed to kill uncaptured client: {}", signal_error);
                }
                child.wait().await;
                return Err(e);
            }
        };

        let watcher = OutputWatcher::spawn(
            output,
            WatcherOptions {
                marker: self.config.marker.clone(),
                keep_last_n: self.config.tail_lines,
                echo: self.config.verbose,
            },
            Latch::new(),
            Latch::new(),
        );

        Ok(SupervisedProcess { child, watcher })
    }

    /// Report a failure for a process that has exited or been stopped
    async fn abandon(&mut self, process: SupervisedProcess, failure: Failure) -> ConnectionResult {
        process.watcher.wait_exited(OUTPUT_DRAIN).await;
        let tail = process.watcher.tail();
        drop(process);

        self.cleanup.cleanup(false).await;
        self.enter(ConnectPhase::Failed);
        error!("Connection attempt failed: {}", failure);
        ConnectionResult::failed(with_tail(&failure, &tail))
    }

    /// Stop a connected client, clean up and return its exit code
    #[tracing::instrument(skip_all, fields(pid = ?process.pid()))]
    pub async fn teardown(&mut self, mut process: SupervisedProcess) -> i32 {
        let rc = stop(&mut process.child, self.grace()).await;
        drop(process);

        let outcome = self.cleanup.cleanup(self.config.verbose).await;
        if !outcome.ok {
            warn!("Cleanup after disconnect failed: {}", outcome.reason);
        }

        self.enter(ConnectPhase::Idle);
        info!("Tunnel client stopped with exit code {}", rc);
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tags() {
        let cases = [
            (Failure::ExitedEarly { rc: 1 }, "openvpn-exited-early rc=1"),
            (
                Failure::TimeoutWaitingInit { final_rc: -2 },
                "timeout-waiting-init final_rc=-2",
            ),
            (Failure::ExitedAfterInit { rc: 0 }, "exited-after-init rc=0"),
            (Failure::DiedDuringProbe { rc: 3 }, "died-during-probe rc=3"),
            (
                Failure::ProbeFailed {
                    last_reason: "route-to-1.1.1.1-not-utun".to_string(),
                    final_rc: -15,
                },
                "init-seen-but-probe-failed: route-to-1.1.1.1-not-utun; stopped rc=-15",
            ),
            (
                Failure::Launch(LaunchError::EmptyCommand),
                "launch-failed: Empty command line",
            ),
        ];

        for (failure, expected) in cases {
            assert_eq!(failure.to_string(), expected);
        }
    }

    #[test]
    fn test_reason_carries_tail() {
        let reason = with_tail(&Failure::ExitedEarly { rc: 1 }, "AUTH_FAILED\nexiting\n");
        assert_eq!(
            reason,
            "openvpn-exited-early rc=1\nTAIL:\nAUTH_FAILED\nexiting\n"
        );

        let result = ConnectionResult::failed(reason);
        assert!(!result.ok());
        assert!(result.process().is_none());
        assert_eq!(result.tag(), "openvpn-exited-early rc=1");
    }

    #[test]
    fn test_failed_result_without_tail() {
        let result = ConnectionResult::failed("cleanup-failed: boom".to_string());
        assert_eq!(result.tag(), "cleanup-failed: boom");
        assert!(result.into_process().is_none());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ConnectPhase::PreCleanup.to_string(), "PRE_CLEANUP");
        assert_eq!(ConnectPhase::PostInitCheck.to_string(), "POST_INIT_CHECK");
        assert_eq!(ConnectPhase::Failed.to_string(), "FAILED");
    }
}
