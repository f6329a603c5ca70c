//! Platform shell executor.
//!
//! Runs `/bin/sh -c <script>` (or `cmd /c <script>` on Windows) through
//! `tokio::process`, never changing the server's own working directory.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::platform::{self, DEFAULT_SHELL};
use super::{ExecRequest, Executor, OutputSink};
use crate::transport::{Response, ResultCode};

/// Executor that hands scripts to a shell interpreter.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    program: String,
    flag: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    /// Uses the platform shell.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shell(DEFAULT_SHELL.0, DEFAULT_SHELL.1)
    }

    /// Uses `program flag <script>` instead of the platform shell.
    #[must_use]
    pub fn with_shell(program: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flag: flag.into(),
        }
    }

    fn describe(&self, script: &str) -> String {
        format!("{} {} {script}", self.program, self.flag)
    }

    async fn prepare(&self, req: &ExecRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.flag).arg(&req.script).stdin(Stdio::null());

        if let Some(dir) = &req.dir {
            match tokio::fs::metadata(dir).await {
                Ok(meta) if meta.is_dir() => {
                    cmd.current_dir(dir);
                }
                Ok(_) => {
                    warn!(dir = %dir.display(), "Not a directory, running in server directory");
                }
                Err(e) => {
                    warn!(
                        dir = %dir.display(),
                        error = %e,
                        "Cannot enter directory, running in server directory"
                    );
                }
            }
        }
        cmd
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    #[instrument(skip_all, fields(script = %req.script, wait = req.wait))]
    async fn shell(
        &self,
        req: ExecRequest,
        out: OutputSink,
        cancel: CancellationToken,
    ) -> Response {
        let shown = self.describe(&req.script);
        let mut cmd = self.prepare(&req).await;
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        if !req.wait {
            platform::detach(&mut cmd);
            return match cmd.spawn() {
                Ok(child) => {
                    debug!(pid = ?child.id(), "Started detached command");
                    Response::ok(format!("start command[{shown}] success, not waiting"))
                }
                Err(e) => start_failed(&shown, &e),
            };
        }

        cmd.kill_on_drop(true);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return start_failed(&shown, &e),
        };
        debug!(pid = ?child.id(), "Started command, waiting");

        let progress = format!("start command[{shown}] success, waiting for completion\n");
        out.send(progress.into_bytes()).await;

        let status = tokio::select! {
            status = child.wait() => status,
            () = cancel.cancelled() => return cancelled(&mut child, &shown).await,
        };

        match status {
            Ok(status) => {
                let code = platform::exit_code(status);
                debug!(exit_code = code, "Command finished");
                Response::new(
                    ResultCode::Ok,
                    code,
                    format!("command[{shown}] exited with code {code}"),
                )
            }
            Err(e) => Response::error(
                ResultCode::ExecFailed,
                format!("wait for command[{shown}]: {e}"),
            ),
        }
    }

    #[instrument(skip_all, fields(script = %req.script))]
    async fn popen(
        &self,
        req: ExecRequest,
        out: OutputSink,
        cancel: CancellationToken,
    ) -> Response {
        let shown = self.describe(&req.script);
        let mut cmd = self.prepare(&req).await;
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return start_failed(&shown, &e),
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Response::error(
                ResultCode::ExecFailed,
                format!("popen({shown}): output pipes unavailable"),
            );
        };

        tokio::select! {
            () = forward_lines(stdout, stderr, &out) => {}
            () = cancel.cancelled() => return cancelled(&mut child, &shown).await,
        }

        let status = tokio::select! {
            status = child.wait() => status,
            () = cancel.cancelled() => return cancelled(&mut child, &shown).await,
        };

        match status {
            Ok(status) => {
                let code = platform::exit_code(status);
                debug!(exit_code = code, "Streaming command finished");
                Response::new(
                    ResultCode::Ok,
                    code,
                    format!("popen({shown}) completed with exit code {code}"),
                )
            }
            Err(e) => Response::error(ResultCode::ExecFailed, format!("popen({shown}): {e}")),
        }
    }
}

fn start_failed(shown: &str, e: &std::io::Error) -> Response {
    warn!(command = %shown, error = %e, "Failed to start command");
    Response::error(
        ResultCode::ExecFailed,
        format!("start command[{shown}] failed: {e}"),
    )
}

async fn cancelled(child: &mut Child, shown: &str) -> Response {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill cancelled command");
    }
    debug!(command = %shown, "Command cancelled");
    Response::error(ResultCode::ExecFailed, format!("command[{shown}] cancelled"))
}

/// Forwards complete lines from both pipes until both reach end of stream.
async fn forward_lines(stdout: ChildStdout, stderr: ChildStderr, out: &OutputSink) {
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    // Kept across iterations: a read interrupted by the other branch leaves
    // its partial line here.
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let line = tokio::select! {
            line = next_line(&mut stdout, &mut stdout_buf), if stdout_open => {
                stdout_open = line.is_some();
                line
            }
            line = next_line(&mut stderr, &mut stderr_buf), if stderr_open => {
                stderr_open = line.is_some();
                line
            }
        };
        if let Some(line) = line {
            // Keep draining after the writer is gone so the child never blocks on a full pipe.
            out.send(line).await;
        }
    }
}

/// Reads one line, normalizing its terminator to a single `\n`.
///
/// A final line without a terminator is still returned. `None` at end of
/// stream or on a read error.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    match reader.read_until(b'\n', buf).await {
        Ok(0) if buf.is_empty() => None,
        Ok(_) => {
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            buf.push(b'\n');
            Some(std::mem::take(buf))
        }
        Err(e) => {
            debug!(error = %e, "Output pipe failed");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::Outbound;
    use crate::transport::Frame;

    fn sink() -> (OutputSink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        (OutputSink::new(tx), rx)
    }

    fn drain(mut rx: mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(Frame::Binary(bytes)) = item {
                lines.push(String::from_utf8(bytes).unwrap());
            }
        }
        lines
    }

    fn req(script: &str, wait: bool) -> ExecRequest {
        ExecRequest {
            script: script.into(),
            dir: None,
            wait,
        }
    }

    #[tokio::test]
    async fn waited_shell_reports_exit_code() {
        let (out, rx) = sink();
        let resp = ShellExecutor::new()
            .shell(req("exit 7", true), out, CancellationToken::new())
            .await;

        assert_eq!(resp.result, ResultCode::Ok);
        assert_eq!(resp.exit_code, 7);
        let frames = drain(rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("waiting for completion"));
    }

    #[tokio::test]
    async fn detached_shell_returns_without_waiting() {
        let (out, rx) = sink();
        let started = std::time::Instant::now();
        let resp = ShellExecutor::new()
            .shell(req("sleep 5", false), out, CancellationToken::new())
            .await;

        assert_eq!(resp.result, ResultCode::Ok);
        assert_eq!(resp.exit_code, 0);
        assert!(resp.message.contains("not waiting"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(drain(rx).is_empty());
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_start_failure() {
        let (out, _rx) = sink();
        let exec = ShellExecutor::with_shell("/nonexistent/shell", "-c");

        let resp = exec
            .shell(req("true", true), out.clone(), CancellationToken::new())
            .await;
        assert_eq!(resp.result, ResultCode::ExecFailed);
        assert_eq!(resp.exit_code, 0);

        let resp = exec
            .popen(req("true", false), out, CancellationToken::new())
            .await;
        assert_eq!(resp.result, ResultCode::ExecFailed);
        assert_eq!(resp.exit_code, 0);
    }

    #[tokio::test]
    async fn popen_streams_both_pipes() {
        let (out, rx) = sink();
        let resp = ShellExecutor::new()
            .popen(req("echo A; echo B 1>&2", false), out, CancellationToken::new())
            .await;

        assert_eq!(resp.result, ResultCode::Ok);
        assert_eq!(resp.exit_code, 0);
        let mut lines = drain(rx);
        lines.sort();
        assert_eq!(lines, vec!["A\n", "B\n"]);
    }

    #[tokio::test]
    async fn popen_normalizes_line_endings() {
        let (out, rx) = sink();
        ShellExecutor::new()
            .popen(req("printf 'one\\r\\ntwo'", false), out, CancellationToken::new())
            .await;

        assert_eq!(drain(rx), vec!["one\n", "two\n"]);
    }

    #[tokio::test]
    async fn popen_reports_signal_exit() {
        let (out, _rx) = sink();
        let resp = ShellExecutor::new()
            .popen(req("kill -9 $$", false), out, CancellationToken::new())
            .await;
        assert_eq!(resp.exit_code, 137);
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (out, rx) = sink();
        let request = ExecRequest {
            script: "pwd".into(),
            dir: Some(dir.path().to_path_buf()),
            wait: false,
        };
        ShellExecutor::new()
            .popen(request, out, CancellationToken::new())
            .await;

        let lines = drain(rx);
        let printed = std::fs::canonicalize(lines[0].trim_end()).unwrap();
        assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn bad_directory_is_not_fatal() {
        let (out, _rx) = sink();
        let request = ExecRequest {
            script: "exit 3".into(),
            dir: Some("/no/such/directory".into()),
            wait: true,
        };
        let resp = ShellExecutor::new()
            .shell(request, out, CancellationToken::new())
            .await;
        assert_eq!(resp.result, ResultCode::Ok);
        assert_eq!(resp.exit_code, 3);
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let (out, _rx) = sink();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let resp = ShellExecutor::new()
            .popen(req("sleep 30", false), out, cancel)
            .await;

        assert_eq!(resp.result, ResultCode::ExecFailed);
        assert!(resp.message.contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
