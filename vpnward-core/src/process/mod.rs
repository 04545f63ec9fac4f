//! Child process management
//!
//! Spawning commands as process-group leaders, delivering stop signals,
//! the escalating stopper and the (optionally privileged) command runner.

pub mod runner;
pub mod signal;
pub mod stopper;

pub use runner::{CommandOutput, CommandRequest, CommandRunner, CommandStatus, SystemCommandRunner};
pub use signal::StopSignal;
pub use stopper::{stop, StopGrace};

use crate::error::LaunchError;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::warn;

/// Exit code of a finished process
///
/// A process terminated by signal N reports `-N`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}

/// Read end of a child's merged stdout and stderr
#[cfg(unix)]
pub type ChildOutput = tokio::net::unix::pipe::Receiver;

/// Read end of a child's stdout
#[cfg(not(unix))]
pub type ChildOutput = tokio::process::ChildStdout;

/// A child process that leads its own process group
///
/// Stdin is closed. On Unix stdout and stderr share one pipe, so the caller
/// reads both streams in the order they were written. Elsewhere only stdout
/// is captured.
#[derive(Debug)]
pub struct ManagedChild {
    child: Child,
    pgid: Option<u32>,
    output: Option<ChildOutput>,
}

impl ManagedChild {
    /// Spawn `argv` in a new process group
    pub fn spawn(argv: &[String]) -> Result<Self, LaunchError> {
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;

        let mut std_cmd = std::process::Command::new(program);
        std_cmd.args(args).stdin(Stdio::null());

        #[cfg(unix)]
        let reader = {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);

            let pipe_failed = |e: std::io::Error| LaunchError::SpawnFailed {
                reason: format!("output pipe: {}", e),
            };
            let (writer, reader) = tokio::net::unix::pipe::pipe().map_err(pipe_failed)?;
            let writer = writer.into_blocking_fd().map_err(pipe_failed)?;
            std_cmd
                .stderr(writer.try_clone().map_err(pipe_failed)?)
                .stdout(writer);
            reader
        };

        #[cfg(not(unix))]
        std_cmd.stdout(Stdio::piped()).stderr(Stdio::null());

        // Dropping the command closes the parent's copies of the write end
        let child = Command::from(std_cmd)
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed {
                reason: format!("{}: {}", program, e),
            })?;

        #[cfg(unix)]
        let output = Some(reader);
        #[cfg(not(unix))]
        let (child, output) = {
            let mut child = child;
            let stdout = child.stdout.take();
            (child, stdout)
        };

        // The group id equals the leader's pid
        let pgid = if cfg!(unix) { child.id() } else { None };

        Ok(Self {
            child,
            pgid,
            output,
        })
    }

    /// OS process id, `None` once the process has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    /// Take the captured output stream
    pub fn take_output(&mut self) -> Result<ChildOutput, LaunchError> {
        self.output.take().ok_or(LaunchError::OutputNotCaptured)
    }

    /// Non-blocking exit check
    pub fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(status) => status.map(exit_code_of),
            Err(e) => {
                warn!("Failed to poll process status: {}", e);
                None
            }
        }
    }

    /// Wait at most `limit` for the process to exit
    pub async fn wait_for_exit(&mut self, limit: Duration) -> Option<i32> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => Some(exit_code_of(status)),
            Ok(Err(e)) => {
                warn!("Failed to wait for process: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    /// Wait without bound for the process to exit
    pub async fn wait(&mut self) -> i32 {
        match self.child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                warn!("Failed to wait for process: {}", e);
                -1
            }
        }
    }

    /// Deliver a stop signal to the process group (or the process alone)
    pub fn signal(&mut self, signal: StopSignal) -> std::io::Result<()> {
        signal::deliver(&mut self.child, self.pgid, signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_spawn_rejects_empty_argv() {
        let result = ManagedChild::spawn(&[]);
        assert!(matches!(result, Err(LaunchError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let result = ManagedChild::spawn(&["/nonexistent/vpnward-client".to_string()]);
        match result {
            Err(LaunchError::SpawnFailed { reason }) => {
                assert!(reason.contains("/nonexistent/vpnward-client"))
            }
            other => panic!("Expected SpawnFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let mut child = ManagedChild::spawn(&argv("exit 7")).unwrap();
        assert_eq!(child.wait().await, 7);
        assert_eq!(child.try_exit_code(), Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_leads_its_own_group() {
        let mut child = ManagedChild::spawn(&argv("sleep 5")).unwrap();
        let pid = child.id().unwrap();
        assert_eq!(child.pgid(), Some(pid));

        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid as i32))).unwrap();
        assert_eq!(pgid.as_raw() as u32, pid);

        child.signal(StopSignal::Kill).unwrap();
        assert_eq!(child.wait().await, -9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_keeps_write_order_across_streams() {
        use tokio::io::AsyncReadExt;

        for _ in 0..20 {
            let mut child =
                ManagedChild::spawn(&argv("echo a; echo b >&2; echo c >&2; echo d")).unwrap();
            let mut output = child.take_output().unwrap();
            let mut text = String::new();
            output.read_to_string(&mut text).await.unwrap();

            assert_eq!(text, "a\nb\nc\nd\n");
            assert_eq!(child.wait().await, 0);
        }
    }

    #[tokio::test]
    async fn test_output_can_only_be_taken_once() {
        let mut child = ManagedChild::spawn(&argv("true")).unwrap();
        assert!(child.take_output().is_ok());
        assert!(matches!(
            child.take_output(),
            Err(LaunchError::OutputNotCaptured)
        ));
        child.wait().await;
    }

    #[tokio::test]
    async fn test_wait_for_exit_times_out_on_running_process() {
        let mut child = ManagedChild::spawn(&argv("sleep 5")).unwrap();
        assert_eq!(child.wait_for_exit(Duration::from_millis(100)).await, None);
        child.signal(StopSignal::Kill).unwrap();
        child.wait().await;
    }
}
