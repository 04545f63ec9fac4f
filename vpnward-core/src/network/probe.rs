//! Independent tunnel verification
//!
//! A client can log that it is initialized before the OS routes traffic
//! through its interface, or while the tunnel endpoint is unreachable. The
//! probe checks the routing table and then plain TCP reachability.

use crate::error::ConfigError;
use crate::network::platform::{PlatformCommands, CURRENT};
use crate::network::public_ip::PublicIpLookup;
use crate::process::{CommandRequest, CommandRunner};
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Destination whose route must go through the tunnel
pub const ROUTE_CHECK_TARGET: &str = "1.1.1.1";

/// Fewest distinct targets a probe may check
pub const MIN_TARGETS: usize = 2;

/// Upper bound for a single TCP connect attempt
pub const PER_TARGET_TIMEOUT: Duration = Duration::from_secs(3);

const ROUTE_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(3);

/// A host:port pair probed for reachability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Targets probed in order; all must be reachable
pub fn default_targets() -> Vec<ProbeTarget> {
    vec![
        ProbeTarget::new("api.ipify.org", 443),
        ProbeTarget::new("1.1.1.1", 443),
    ]
}

/// Result of a probe, with a short machine-parsable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub reason: String,
}

impl ProbeOutcome {
    pub fn passed() -> Self {
        Self {
            ok: true,
            reason: "probe-ok".to_string(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

/// Read-only view of the network state
pub trait NetworkProbe: Send + Sync {
    /// Route check (optional) followed by TCP reachability of every target
    fn internet_probe(
        &self,
        require_tunnel_route: bool,
        timeout: Duration,
    ) -> impl Future<Output = ProbeOutcome> + Send;

    /// Log routing, proxy and DNS state for humans; never used for decisions
    fn snapshot(&self, label: &str) -> impl Future<Output = ()> + Send;

    /// Current public exit IP, if it can be determined
    fn public_ip(&self) -> impl Future<Output = Option<String>> + Send;
}

/// Probe backed by OS commands and real sockets
#[derive(Debug)]
pub struct SystemNetworkProbe<R> {
    runner: Arc<R>,
    platform: &'static PlatformCommands,
    tunnel_route: Regex,
    route_target: String,
    targets: Vec<ProbeTarget>,
    ip_lookup: Option<PublicIpLookup>,
}

impl<R: CommandRunner> SystemNetworkProbe<R> {
    /// Probe for the current platform with the default targets
    pub fn new(runner: Arc<R>) -> Self {
        let ip_lookup = match PublicIpLookup::ipify() {
            Ok(lookup) => Some(lookup),
            Err(e) => {
                warn!("Public IP lookup unavailable: {}", e);
                None
            }
        };

        Self {
            runner,
            platform: &CURRENT,
            tunnel_route: Regex::new(CURRENT.tunnel_route_pattern)
                .expect("Failed to compile tunnel_route pattern"),
            route_target: ROUTE_CHECK_TARGET.to_string(),
            targets: default_targets(),
            ip_lookup,
        }
    }

    /// Replace the probed targets; at least [`MIN_TARGETS`] distinct ones
    pub fn with_targets(mut self, targets: Vec<ProbeTarget>) -> Result<Self, ConfigError> {
        let distinct = targets
            .iter()
            .enumerate()
            .filter(|(index, target)| !targets[..*index].contains(target))
            .count();
        if distinct < MIN_TARGETS {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "probe needs at least {} distinct targets, got {}",
                    MIN_TARGETS, distinct
                ),
            });
        }

        self.targets = targets;
        Ok(self)
    }

    pub fn with_ip_lookup(mut self, ip_lookup: Option<PublicIpLookup>) -> Self {
        self.ip_lookup = ip_lookup;
        self
    }

    pub fn targets(&self) -> &[ProbeTarget] {
        &self.targets
    }

    /// True iff the OS routes `ip` through a tunnel interface
    pub async fn route_uses_tunnel(&self, ip: &str) -> bool {
        let request = CommandRequest::new(self.platform.route_get_argv(ip))
            .with_timeout(ROUTE_QUERY_TIMEOUT)
            .with_label("route-get");
        let output = self.runner.run(&request).await;

        if !output.success() {
            debug!(ip, exit_code = output.exit_code, "Route lookup failed");
            return false;
        }

        match tunnel_interface(&self.tunnel_route, &output.output) {
            Some(interface) => {
                debug!(ip, interface = %interface, "Route uses tunnel interface");
                true
            }
            None => false,
        }
    }
}

impl<R: CommandRunner> NetworkProbe for SystemNetworkProbe<R> {
    #[tracing::instrument(skip(self))]
    async fn internet_probe(&self, require_tunnel_route: bool, timeout: Duration) -> ProbeOutcome {
        if require_tunnel_route && !self.route_uses_tunnel(&self.route_target).await {
            return ProbeOutcome::failed(format!("route-to-{}-not-utun", self.route_target));
        }

        let per_target = timeout.min(PER_TARGET_TIMEOUT);
        let started = Instant::now();
        for target in &self.targets {
            if !tcp_reachable(&target.host, target.port, per_target).await {
                let reason = format!(
                    "tcp-connect-failed {} after {:.2}s",
                    target,
                    started.elapsed().as_secs_f64()
                );
                debug!(reason = %reason, "Probe failed");
                return ProbeOutcome::failed(reason);
            }
        }

        ProbeOutcome::passed()
    }

    async fn snapshot(&self, label: &str) {
        diagnostic_snapshot(self.runner.as_ref(), label).await;
    }

    async fn public_ip(&self) -> Option<String> {
        let lookup = self.ip_lookup.as_ref()?;
        match lookup.lookup().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("Public IP lookup failed: {}", e);
                None
            }
        }
    }
}

/// Tunnel interface named in a route lookup, if any
pub fn tunnel_interface(pattern: &Regex, route_output: &str) -> Option<String> {
    pattern
        .captures(route_output)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Plain TCP connect within `timeout`
pub async fn tcp_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "TCP connect failed");
            false
        }
        Err(_) => {
            debug!(host, port, "TCP connect timed out after {:?}", timeout);
            false
        }
    }
}

/// Dump routing, proxy and DNS state at DEBUG level
pub async fn diagnostic_snapshot<R: CommandRunner + ?Sized>(runner: &R, label: &str) {
    debug!("===== SNAPSHOT ({}) =====", label);
    for (name, argv) in [
        ("routes", CURRENT.route_dump),
        ("proxy", CURRENT.proxy_dump),
        ("dns", CURRENT.dns_dump),
    ] {
        let request = CommandRequest::new(argv.iter().copied())
            .with_timeout(SNAPSHOT_TIMEOUT)
            .with_label(name);
        let output = runner.run(&request).await;
        debug!(
            snapshot = label,
            command = %request.display(),
            exit_code = output.exit_code,
            "{}",
            output.output.trim_end()
        );
    }
    debug!("===== END SNAPSHOT =====");
}
