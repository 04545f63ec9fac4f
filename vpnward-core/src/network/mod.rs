//! Network inspection
//!
//! Route checks, TCP reachability, diagnostics snapshots and the public IP
//! lookup. Nothing in here changes network state except the platform
//! command table consumed by the cleanup routine.

pub mod platform;
pub mod probe;
pub mod public_ip;

pub use platform::{PlatformCommands, CURRENT, SPLIT_DEFAULT_ROUTES};
pub use probe::{
    diagnostic_snapshot, tcp_reachable, NetworkProbe, ProbeOutcome, ProbeTarget,
    SystemNetworkProbe,
};
pub use public_ip::{PublicIpError, PublicIpLookup};
