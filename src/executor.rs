//! Process execution for `shell` and `popen` commands.
//!
//! The connection actor talks to an [`Executor`]; [`ShellExecutor`] is the
//! real implementation. Platform details (shell path, detaching, exit-code
//! normalization) are kept in `platform` so callers never branch on the OS.

mod platform;
mod shell;

pub use shell::ShellExecutor;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::Outbound;
use crate::transport::{Command, Frame, Response};

/// A shell script to run and how to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Script text handed to the platform shell.
    pub script: String,
    /// Working directory for the child, if any.
    pub dir: Option<PathBuf>,
    /// Wait for the child to exit (`shell` only).
    pub wait: bool,
}

impl From<&Command> for ExecRequest {
    fn from(cmd: &Command) -> Self {
        Self {
            script: cmd.target.clone(),
            dir: (!cmd.dir.is_empty()).then(|| PathBuf::from(&cmd.dir)),
            wait: cmd.wait,
        }
    }
}

/// Handle for emitting binary frames onto a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<Outbound>,
}

impl OutputSink {
    /// Wraps the sending side of an outbound queue.
    pub const fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queues `bytes` as one binary frame.
    ///
    /// Waits while the queue is full. Returns `false` once the connection's
    /// writer has gone away.
    pub async fn send(&self, bytes: Vec<u8>) -> bool {
        self.tx
            .send(Outbound::Frame(Frame::Binary(bytes)))
            .await
            .is_ok()
    }
}

/// Runs shell scripts on behalf of a connection.
///
/// Implementations never fail: every outcome, including start failures and
/// cancellation, is reported as a [`Response`].
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Runs `req.script`, detached when `req.wait` is false.
    ///
    /// In wait mode a progress frame is sent through `out` once the child
    /// has started. Cancelling `cancel` kills a waited-on child.
    async fn shell(&self, req: ExecRequest, out: OutputSink, cancel: CancellationToken)
        -> Response;

    /// Runs `req.script`, streaming each stdout and stderr line through `out`.
    ///
    /// Cancelling `cancel` kills the child.
    async fn popen(&self, req: ExecRequest, out: OutputSink, cancel: CancellationToken)
        -> Response;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CommandKind;

    #[test]
    fn request_from_command() {
        let cmd = Command::process(CommandKind::Shell, "make install", "/srv/app", true);
        let req = ExecRequest::from(&cmd);
        assert_eq!(req.script, "make install");
        assert_eq!(req.dir, Some(PathBuf::from("/srv/app")));
        assert!(req.wait);
    }

    #[test]
    fn empty_dir_means_inherit() {
        let cmd = Command::process(CommandKind::Popen, "ls", "", false);
        assert_eq!(ExecRequest::from(&cmd).dir, None);
    }

    #[tokio::test]
    async fn sink_reports_closed_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = OutputSink::new(tx);

        assert!(sink.send(b"line\n".to_vec()).await);
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Frame(Frame::Binary(bytes))) if bytes == b"line\n"
        ));

        drop(rx);
        assert!(!sink.send(b"late\n".to_vec()).await);
    }
}
