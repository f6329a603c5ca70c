//! One server-side connection.
//!
//! The socket is split in two. A reader task decodes commands and dispatches
//! them; a writer task owns the write half and drains a bounded queue of
//! [`Outbound`] items. Uploads are handled inline by the reader because their
//! body frames arrive on the same stream. Process commands run in tracked
//! tasks, at most one at a time per connection.
//!
//! Teardown starts when the reader stops for any reason (peer gone, bad
//! frame, panic). Running commands are cancelled and joined with a bound,
//! then the writer drains what is left and closes the socket.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::executor::{ExecRequest, Executor, OutputSink};
use crate::transfer;
use crate::transport::{
    self, Command, CommandKind, Frame, FrameReader, FrameWriter, Response, ResultCode,
    TransportError,
};

/// Capacity of the per-connection outbound queue.
pub const OUTBOUND_CAPACITY: usize = 10;

/// How long teardown waits for running commands, and then for the writer.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// An item queued for the writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A raw frame, typically process output.
    Frame(Frame),
    /// Reply to a command the reader handled itself.
    Reply(Response),
    /// Final reply of a process command. Frees the connection for the next one.
    Finished(Response),
}

/// A server-side connection waiting to be run.
pub struct Connection<S, E> {
    ws: WebSocketStream<S>,
    executor: Arc<E>,
    peer: String,
}

impl<S, E> Connection<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: Executor,
{
    /// Wraps an accepted WebSocket.
    pub fn new(ws: WebSocketStream<S>, executor: Arc<E>, peer: impl Into<String>) -> Self {
        Self {
            ws,
            executor,
            peer: peer.into(),
        }
    }

    /// Serves the connection until the peer goes away, then tears it down.
    #[instrument(skip_all, fields(peer = %self.peer))]
    pub async fn run(self) {
        info!("Connection opened");

        let (writer, reader) = transport::split(self.ws);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut writer_task = tokio::spawn(
            write_loop(writer, rx, Arc::clone(&pending), cancel.clone()).in_current_span(),
        );

        let dispatcher = Dispatcher {
            executor: self.executor,
            tx,
            pending,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        };
        let reader_task = tokio::spawn(dispatcher.read_loop(reader).in_current_span());

        match reader_task.await {
            Ok(reason) => debug!(reason, "Reader stopped"),
            Err(e) if e.is_panic() => error!("Reader panicked"),
            Err(e) => warn!(error = %e, "Reader task failed"),
        }

        cancel.cancel();
        tracker.close();
        if tokio::time::timeout(JOIN_TIMEOUT, tracker.wait()).await.is_err() {
            warn!(tasks = tracker.len(), "Commands still running after cancellation");
        }

        match tokio::time::timeout(JOIN_TIMEOUT, &mut writer_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Writer task failed"),
            Err(_) => {
                warn!("Writer did not drain in time");
                writer_task.abort();
            }
        }

        info!("Connection closed");
    }
}

/// Drains the outbound queue onto the socket, then closes it.
///
/// A failed write cancels the connection so the reader stops too.
async fn write_loop<S>(
    mut writer: FrameWriter<S>,
    mut rx: mpsc::Receiver<Outbound>,
    pending: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        let sent = match item {
            Outbound::Frame(frame) => writer.send(frame).await,
            Outbound::Reply(resp) => writer.send_control(&resp).await,
            Outbound::Finished(resp) => {
                // Cleared before the write so a peer that has seen the
                // response can never be refused.
                pending.store(false, Ordering::Release);
                writer.send_control(&resp).await
            }
        };
        if let Err(e) = sent {
            debug!(error = %e, "Write failed");
            cancel.cancel();
            break;
        }
    }
    writer.close().await;
}

/// Reader-side state.
struct Dispatcher<E> {
    executor: Arc<E>,
    tx: mpsc::Sender<Outbound>,
    pending: Arc<AtomicBool>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<E: Executor> Dispatcher<E> {
    /// Reads and dispatches commands. Returns why it stopped.
    async fn read_loop<S>(self, mut reader: FrameReader<S>) -> &'static str
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => return "cancelled",
                frame = reader.recv() => frame,
            };

            let text = match frame {
                Ok(Frame::Text(text)) => text,
                Ok(Frame::Binary(bytes)) => {
                    warn!(bytes = bytes.len(), "Binary frame outside an upload");
                    return "unexpected binary frame";
                }
                Err(TransportError::Closed) => return "peer closed",
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    return "read error";
                }
            };

            let cmd: Command = match serde_json::from_str(&text) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(error = %e, "Malformed command");
                    self.reply(Response::error(
                        ResultCode::Malformed,
                        format!("invalid command: {e}"),
                    ))
                    .await;
                    return "malformed command";
                }
            };

            if !self.dispatch(&mut reader, cmd).await {
                return "outbound queue closed";
            }
        }
    }

    /// Handles one command. `false` once the writer is gone.
    async fn dispatch<S>(&self, reader: &mut FrameReader<S>, cmd: Command) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match &cmd.cmd {
            CommandKind::Upload => {
                info!(target = %cmd.target, length = cmd.length, "Upload requested");
                let resp = tokio::select! {
                    () = self.cancel.cancelled() => return false,
                    resp = transfer::receive(reader, &cmd) => resp,
                };
                self.reply(resp).await
            }
            kind if kind.is_process() => self.start_process(&cmd).await,
            kind => {
                warn!(cmd = %kind, "Unsupported command");
                self.reply(Response::error(
                    ResultCode::UnsupportedCommand,
                    format!("Unsupported command: {kind}"),
                ))
                .await
            }
        }
    }

    /// Spawns a process command unless one is already running.
    async fn start_process(&self, cmd: &Command) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            warn!(cmd = %cmd.cmd, "Rejected, previous command still running");
            return self
                .reply(Response::error(
                    ResultCode::PipelineDisallowed,
                    "pipeline is not supported, previous command is still running",
                ))
                .await;
        }

        let kind = cmd.cmd.clone();
        let req = ExecRequest::from(cmd);
        info!(cmd = %kind, script = %req.script, wait = req.wait, "Starting process");

        let executor = Arc::clone(&self.executor);
        let out = OutputSink::new(self.tx.clone());
        let tx = self.tx.clone();
        let cancel = self.cancel.child_token();

        self.tracker.spawn(
            async move {
                let run = async {
                    if kind == CommandKind::Popen {
                        executor.popen(req, out, cancel).await
                    } else {
                        executor.shell(req, out, cancel).await
                    }
                };
                let resp = AssertUnwindSafe(run).catch_unwind().await.unwrap_or_else(|_| {
                    error!("Command task panicked");
                    Response::error(ResultCode::ExecFailed, "command task panicked")
                });
                debug!(result = ?resp.result, exit_code = resp.exit_code, "Process finished");
                if tx.send(Outbound::Finished(resp)).await.is_err() {
                    debug!("Connection gone before the command finished");
                }
            }
            .in_current_span(),
        );
        true
    }

    async fn reply(&self, resp: Response) -> bool {
        self.tx.send(Outbound::Reply(resp)).await.is_ok()
    }
}
