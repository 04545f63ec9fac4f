//! Tunnel client supervision
//!
//! Launch template, output watcher, cleanup routine and the connection
//! state machine that ties them together.

pub mod cleanup;
pub mod launch;
pub mod supervisor;
pub mod watcher;

pub use cleanup::{Cleanup, CleanupOutcome, SystemCleanup};
pub use launch::{ConnectRequest, LaunchSpec};
pub use supervisor::{
    ConnectPhase, ConnectionResult, SupervisedProcess, Supervisor, SystemSupervisor,
};
pub use watcher::{Latch, OutputWatcher, TailBuffer, WatcherOptions};
