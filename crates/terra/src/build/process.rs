//! Managed child processes
//!
//! Every external program terra starts (compilers, archivers, the built
//! executable) goes through [`ManagedChild`]. The child is killed when the handle
//! is dropped, so cancelling the future that owns it (Ctrl-C, a failed sibling
//! job) never leaves an orphaned process behind.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::Result;

/// Callback for log lines
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A child process owned by terra
#[derive(Debug)]
pub struct ManagedChild {
    child: Child,
    label: String,
}

impl ManagedChild {
    /// Start a process; it is killed if the handle is dropped before it exits
    pub fn spawn(command: &mut Command, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        tracing::debug!("Running {}: {:?}", label, command.as_std());

        let child = command.kill_on_drop(true).spawn()?;
        Ok(Self { child, label })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) -> Result<()> {
        tracing::debug!("Killing {}", self.label);
        self.child.kill().await?;
        Ok(())
    }

    /// Give the process `grace` to exit on its own (it shares the terminal's
    /// interrupt), then kill it. Returns the exit status if it exited in time.
    pub async fn shutdown(mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => {
                tracing::warn!("{} did not exit within {:?}, killing it", self.label, grace);
                self.kill().await?;
                Ok(None)
            }
        }
    }

    /// Start capturing piped stdout/stderr in background tasks
    fn capture_output(
        &mut self,
        callback: Option<LogCallback>,
    ) -> (Option<JoinHandle<String>>, Option<JoinHandle<String>>) {
        let stdout = self.child.stdout.take().map(|out| {
            let label = self.label.clone();
            let callback = callback.clone();
            tokio::spawn(async move { capture_lines(out, label, false, callback).await })
        });
        let stderr = self.child.stderr.take().map(|err| {
            let label = self.label.clone();
            tokio::spawn(async move { capture_lines(err, label, true, callback).await })
        });
        (stdout, stderr)
    }
}

/// Exit status and captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Everything the tool printed, stderr first, unmodified
    pub fn diagnostics(&self) -> String {
        let mut text = self.stderr.clone();
        if !self.stdout.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stdout);
        }
        text
    }
}

/// Run a command with log capture
///
/// Each stdout/stderr line is:
/// 1. Logged via tracing under the `build_output` target
/// 2. Passed to the callback for progress display
/// 3. Kept verbatim in the returned [`CommandOutput`]
///
/// A non-zero exit is not an error here; callers decide what it means.
pub async fn run_command_with_logging(
    command: &mut Command,
    label: &str,
    log_callback: Option<LogCallback>,
) -> Result<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = ManagedChild::spawn(command, label)?;

    let (stdout_handle, stderr_handle) = child.capture_output(log_callback);

    let status = child.wait().await?;

    let stdout = join_output(stdout_handle).await;
    let stderr = join_output(stderr_handle).await;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

async fn join_output(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

async fn capture_lines<R>(
    reader: R,
    label: String,
    is_stderr: bool,
    callback: Option<LogCallback>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    // Compilers quote source lines, so output is not necessarily UTF-8
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Reading output of {} failed: {}", label, e);
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);

        if is_stderr {
            tracing::warn!(target: "build_output", step = %label, "{}", line);
        } else {
            tracing::debug!(target: "build_output", step = %label, "{}", line);
        }

        if let Some(ref callback) = callback {
            callback(line);
        }

        captured.push_str(line);
        captured.push('\n');
    }

    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo 'main.cpp:1:1: error: boom' >&2; exit 3"]);

        let output = run_command_with_logging(&mut cmd, "test", None).await.unwrap();

        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "main.cpp:1:1: error: boom\n");
        assert_eq!(output.diagnostics(), "main.cpp:1:1: error: boom\nout\n");
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_following_lines() {
        let mut cmd = Command::new("sh");
        cmd.args([
            "-c",
            "printf 'warning: caf\\351\\nmain.cpp:3:1: error: real error\\n' >&2; printf 'tail' ; exit 1",
        ]);

        let output = run_command_with_logging(&mut cmd, "test", None).await.unwrap();

        assert!(!output.success());
        assert_eq!(
            output.stderr,
            "warning: caf\u{FFFD}\nmain.cpp:3:1: error: real error\n"
        );
        assert_eq!(output.stdout, "tail\n");
        assert!(output.diagnostics().contains("error: real error"));
    }

    #[tokio::test]
    async fn test_callback_sees_every_line() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: LogCallback = Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        });

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two"]);
        let output = run_command_with_logging(&mut cmd, "test", Some(callback))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_io_not_found() {
        let mut cmd = Command::new("terra-definitely-not-a-real-tool");
        let err = run_command_with_logging(&mut cmd, "test", None)
            .await
            .unwrap_err();

        match err {
            crate::Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_kills_after_grace() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let child = ManagedChild::spawn(&mut cmd, "sleep").unwrap();

        let status = child.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_returns_status_of_exited_child() {
        let mut cmd = Command::new("true");
        let child = ManagedChild::spawn(&mut cmd, "true").unwrap();

        let status = child.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(status.unwrap().success());
    }
}
