//! Escalating process stopper
//!
//! SIGINT, then SIGTERM, then SIGKILL to the whole process group, waiting a
//! bounded grace period after each of the first two. Returns only once the
//! process has been reaped.

use crate::config::SupervisorConfig;
use crate::process::{ManagedChild, StopSignal};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grace periods of the stop ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopGrace {
    /// Wait after SIGINT
    pub sigint: Duration,
    /// Wait after SIGTERM
    pub sigterm: Duration,
}

impl Default for StopGrace {
    fn default() -> Self {
        Self {
            sigint: Duration::from_secs(5),
            sigterm: Duration::from_secs(3),
        }
    }
}

impl StopGrace {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            sigint: config.sigint_grace(),
            sigterm: config.sigterm_grace(),
        }
    }
}

/// Stop `child` and return its exit code
///
/// Already-exited processes return immediately. A signal that cannot be
/// delivered is logged and the ladder moves on to the next one. The final
/// wait after SIGKILL is unbounded.
#[tracing::instrument(skip_all, fields(pid = ?child.id()))]
pub async fn stop(child: &mut ManagedChild, grace: StopGrace) -> i32 {
    if let Some(code) = child.try_exit_code() {
        debug!("Process already exited with code {}", code);
        return code;
    }

    for (signal, wait) in [
        (StopSignal::Interrupt, grace.sigint),
        (StopSignal::Terminate, grace.sigterm),
    ] {
        info!("Sending {} to process group", signal);
        if let Err(e) = child.signal(signal) {
            warn!("Failed to send {}: {}", signal, e);
        }

        if let Some(code) = child.wait_for_exit(wait).await {
            info!("Process exited with code {} after {}", code, signal);
            return code;
        }

        warn!("Process still running {:?} after {}, escalating", wait, signal);
    }

    warn!("Sending {} to process group", StopSignal::Kill);
    if let Err(e) = child.signal(StopSignal::Kill) {
        warn!("Failed to send {}: {}", StopSignal::Kill, e);
    }

    let code = child.wait().await;
    info!("Process killed, exit code {}", code);
    code
}
