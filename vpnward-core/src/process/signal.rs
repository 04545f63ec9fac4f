//! Stop signal delivery
//!
//! Unix signals the whole process group, falling back to the single process
//! when the group cannot be signalled. Other platforms only support a hard
//! kill of the process itself.

use std::fmt;
use tokio::process::Child;

/// Signals of the stop ladder, mildest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => write!(f, "SIGINT"),
            StopSignal::Terminate => write!(f, "SIGTERM"),
            StopSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Deliver `signal` to the group `pgid`, or to `child` alone
pub(crate) fn deliver(
    child: &mut Child,
    pgid: Option<u32>,
    signal: StopSignal,
) -> std::io::Result<()> {
    imp::deliver(child, pgid, signal)
}

#[cfg(unix)]
mod imp {
    use super::StopSignal;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;
    use tokio::process::Child;
    use tracing::debug;

    fn to_nix(signal: StopSignal) -> Signal {
        match signal {
            StopSignal::Interrupt => Signal::SIGINT,
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }

    pub(super) fn deliver(
        child: &mut Child,
        pgid: Option<u32>,
        signal: StopSignal,
    ) -> std::io::Result<()> {
        let sig = to_nix(signal);

        if let Some(pgid) = pgid {
            match killpg(Pid::from_raw(pgid as i32), sig) {
                Ok(()) => return Ok(()),
                Err(e) => debug!(
                    "Failed to send {} to process group {}: {}, signalling the process",
                    signal, pgid, e
                ),
            }
        }

        match child.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), sig).map_err(std::io::Error::from),
            // Already reaped
            None => Ok(()),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::StopSignal;
    use tokio::process::Child;

    pub(super) fn deliver(
        child: &mut Child,
        _pgid: Option<u32>,
        signal: StopSignal,
    ) -> std::io::Result<()> {
        match signal {
            StopSignal::Kill => child.start_kill(),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("{} is not supported on this platform", other),
            )),
        }
    }
}
