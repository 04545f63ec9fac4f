//! Command runner with optional non-interactive privilege elevation
//!
//! Runs a command with a timeout and captures stdout and stderr, in write
//! order, into one buffer. Outcomes are classified as a normal exit, a timeout (exit code
//! 124, partial output kept) or a failure to start (exit code 127). Check
//! mode turns anything but a zero exit into a `CommandError`.

use crate::config::Elevation;
use crate::error::CommandError;
use crate::process::{ManagedChild, StopSignal};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Exit code reported when a command exceeds its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when a command could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Appended to the partial output of a timed-out command
pub const TIMEOUT_MARKER: &str = "\n[TIMEOUT]\n";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to keep draining the pipe after the process is gone
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// A command to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    argv: Vec<String>,
    timeout: Duration,
    label: String,
    privileged: bool,
}

impl CommandRequest {
    /// Plain command with the default 10 second timeout
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_TIMEOUT,
            label: "cmd".to_string(),
            privileged: false,
        }
    }

    /// Command run through non-interactive privilege elevation
    pub fn privileged<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: "sudo".to_string(),
            privileged: true,
            ..Self::new(argv)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Shell-quoted command line for logs
    pub fn display(&self) -> String {
        quote_argv(&self.argv)
    }
}

/// Render argv the way a shell user would type it
pub fn quote_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    if word
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || "@%+=:,./-".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\"'\"'"))
}

/// How a command run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Exited,
    TimedOut,
    SpawnFailed,
}

/// Exit code and combined output of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
    pub status: CommandStatus,
}

impl CommandOutput {
    pub fn exited(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
            status: CommandStatus::Exited,
        }
    }

    pub fn timed_out(partial_output: impl Into<String>) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            output: format!("{}{}", partial_output.into(), TIMEOUT_MARKER),
            status: CommandStatus::TimedOut,
        }
    }

    pub fn spawn_failed(error: impl std::fmt::Display) -> Self {
        Self {
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            output: format!("[EXCEPTION] {}\n", error),
            status: CommandStatus::SpawnFailed,
        }
    }

    pub fn success(&self) -> bool {
        self.status == CommandStatus::Exited && self.exit_code == 0
    }

    /// Check-mode interpretation of this output
    pub fn check(self, label: &str) -> Result<Self, CommandError> {
        match self.status {
            CommandStatus::Exited if self.exit_code == 0 => Ok(self),
            CommandStatus::Exited => Err(CommandError::Failed {
                label: label.to_string(),
                exit_code: self.exit_code,
                hint: sudo_prompt_hint(&self.output),
                output: self.output,
            }),
            CommandStatus::TimedOut => Err(CommandError::TimedOut {
                label: label.to_string(),
                output: self.output,
            }),
            CommandStatus::SpawnFailed => Err(CommandError::Spawn {
                label: label.to_string(),
                reason: self
                    .output
                    .trim()
                    .trim_start_matches("[EXCEPTION]")
                    .trim()
                    .to_string(),
            }),
        }
    }
}

/// Hint for output that looks like sudo asking for a password
pub fn sudo_prompt_hint(output: &str) -> Option<String> {
    let text = output.to_lowercase();
    let prompting = text.contains("a terminal is required to read the password")
        || text.contains("a password is required")
        || (text.contains("sudo:") && text.contains("password"))
        || text.contains("sorry, you must have a tty");

    prompting.then(|| {
        "Likely cause: sudo is prompting for a password but no terminal is attached.\n\
         Fix: sudo -n is used; grant NOPASSWD for this exact command in sudoers.\n"
            .to_string()
    })
}

/// Executes commands on behalf of the probe, the cleanup routine and tests
pub trait CommandRunner: Send + Sync {
    /// Run a command; never fails, every outcome is described by the output
    fn run(&self, request: &CommandRequest) -> impl Future<Output = CommandOutput> + Send;

    /// Run a command in check mode
    fn run_checked(
        &self,
        request: &CommandRequest,
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send {
        async move { self.run(request).await.check(request.label()) }
    }
}

/// Runs commands as real child processes
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    elevation: Elevation,
    elevation_prefix: Vec<String>,
}

impl SystemCommandRunner {
    pub fn new(elevation: Elevation) -> Self {
        Self {
            elevation,
            elevation_prefix: elevation.prefix(),
        }
    }

    pub fn elevation(&self) -> Elevation {
        self.elevation
    }

    /// Full argv, including the elevation prefix for privileged requests
    pub fn resolve_argv(&self, request: &CommandRequest) -> Vec<String> {
        if request.is_privileged() {
            self.elevation_prefix
                .iter()
                .chain(request.argv())
                .cloned()
                .collect()
        } else {
            request.argv().to_vec()
        }
    }
}

impl CommandRunner for SystemCommandRunner {
    async fn run(&self, request: &CommandRequest) -> CommandOutput {
        let argv = self.resolve_argv(request);
        let label = request.label();
        debug!(label, command = %quote_argv(&argv), "Running command");

        let mut child = match ManagedChild::spawn(&argv) {
            Ok(child) => child,
            Err(e) => {
                debug!(label, error = %e, "Command could not be started");
                return CommandOutput::spawn_failed(e);
            }
        };

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut reader = match child.take_output() {
            Ok(output) => tokio::spawn(collect(output, Arc::clone(&buffer))),
            Err(e) => {
                let _ = child.signal(StopSignal::Kill);
                child.wait().await;
                return CommandOutput::spawn_failed(e);
            }
        };

        let exit_code = child.wait_for_exit(request.timeout()).await;
        if exit_code.is_none() {
            // Kill the whole group so grandchildren release the pipes too
            let _ = child.signal(StopSignal::Kill);
            child.wait().await;
        }

        if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }

        let output = {
            let bytes = buffer.lock().unwrap();
            String::from_utf8_lossy(&bytes).to_string()
        };

        let result = match exit_code {
            Some(code) => CommandOutput::exited(code, output),
            None => CommandOutput::timed_out(output),
        };
        debug!(
            label,
            exit_code = result.exit_code,
            output = %result.output.trim_end(),
            "Command finished"
        );
        result
    }
}

/// Append everything read from `stream` to `buffer`
async fn collect<S>(mut stream: S, buffer: Arc<Mutex<Vec<u8>>>)
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.lock().unwrap().extend_from_slice(&chunk[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandRequest {
        CommandRequest::new(["sh", "-c", script])
    }

    #[test]
    fn test_display_quotes_only_when_needed() {
        let request = CommandRequest::new(["route", "-n", "get", "1.1.1.1"]);
        assert_eq!(request.display(), "route -n get 1.1.1.1");

        let request = CommandRequest::new(["echo", "", "it's here"]);
        assert_eq!(request.display(), "echo '' 'it'\"'\"'s here'");
    }

    #[test]
    fn test_privileged_argv_gets_sudo_prefix() {
        let runner = SystemCommandRunner::new(Elevation::Sudo);
        let argv = runner.resolve_argv(&CommandRequest::privileged(["pkill", "-TERM", "openvpn"]));
        assert!(argv[0].ends_with("sudo"));
        assert_eq!(&argv[1..], ["-n", "pkill", "-TERM", "openvpn"]);

        let plain = runner.resolve_argv(&CommandRequest::new(["true"]));
        assert_eq!(plain, ["true"]);
    }

    #[test]
    fn test_privileged_without_elevation_is_unchanged() {
        let runner = SystemCommandRunner::new(Elevation::None);
        let argv = runner.resolve_argv(&CommandRequest::privileged(["true"]));
        assert_eq!(argv, ["true"]);
    }

    #[test]
    fn test_check_annotates_sudo_prompt() {
        let output = CommandOutput::exited(1, "sudo: a password is required\n");
        match output.check("cleanup-preflight") {
            Err(CommandError::Failed {
                label,
                exit_code,
                hint,
                output,
            }) => {
                assert_eq!(label, "cleanup-preflight");
                assert_eq!(exit_code, 1);
                assert!(hint.unwrap().contains("NOPASSWD"));
                assert!(output.contains("a password is required"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_check_without_prompt_has_no_hint() {
        let err = CommandOutput::exited(2, "no such route\n")
            .check("route")
            .unwrap_err();
        assert_eq!(err.to_string(), "route failed rc=2\nno such route\n");
    }

    #[test]
    fn test_check_classifies_timeout_and_spawn_failure() {
        assert!(matches!(
            CommandOutput::timed_out("partial").check("slow"),
            Err(CommandError::TimedOut { .. })
        ));
        match CommandOutput::spawn_failed("No such file or directory").check("missing") {
            Err(CommandError::Spawn { reason, .. }) => {
                assert_eq!(reason, "No such file or directory")
            }
            other => panic!("Expected Spawn, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_merges_stdout_and_stderr() {
        let runner = SystemCommandRunner::new(Elevation::None);
        let output = runner.run(&shell("echo out; echo err >&2")).await;

        assert!(output.success());
        assert!(output.output.contains("out\n"));
        assert!(output.output.contains("err\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_output_is_in_write_order() {
        let runner = SystemCommandRunner::new(Elevation::None);
        let request = shell("echo a; echo b >&2; echo c");

        for _ in 0..50 {
            let output = runner.run(&request).await;
            assert_eq!(output.output, "a\nb\nc\n");
        }
    }

    #[test]
    fn test_request_default_timeout() {
        assert_eq!(CommandRequest::new(["true"]).timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_reports_nonzero_exit() {
        let runner = SystemCommandRunner::new(Elevation::None);
        let output = runner.run(&shell("echo failing; exit 3")).await;

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.status, CommandStatus::Exited);
        assert_eq!(output.output, "failing\n");
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let runner = SystemCommandRunner::new(Elevation::None);
        let request = shell("echo partial; sleep 5").with_timeout(Duration::from_millis(500));

        let started = std::time::Instant::now();
        let output = runner.run(&request).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(output.status, CommandStatus::TimedOut);
        assert!(output.output.starts_with("partial\n"));
        assert!(output.output.ends_with("[TIMEOUT]\n"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let runner = SystemCommandRunner::new(Elevation::None);
        let output = runner
            .run(&CommandRequest::new(["/nonexistent/vpnward-tool"]))
            .await;

        assert_eq!(output.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert_eq!(output.status, CommandStatus::SpawnFailed);
        assert!(output.output.starts_with("[EXCEPTION]"));
    }

    #[tokio::test]
    async fn test_run_checked_propagates_failure() {
        let runner = SystemCommandRunner::new(Elevation::None);
        let result = runner
            .run_checked(&shell("echo boom; exit 1").with_label("boom"))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().starts_with("boom failed rc=1"));
    }
}
