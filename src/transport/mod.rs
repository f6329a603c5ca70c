//! Transport layer for client ↔ server communication.
//!
//! A WebSocket connection (plain TCP or TLS) is split into a [`FrameWriter`]
//! and a [`FrameReader`] so that one task can write while another reads.
//! Text frames carry JSON control messages from [`protocol`]; binary frames
//! carry file bytes and process output.

pub mod protocol;
pub mod tls;

pub use protocol::{Command, CommandKind, Response, ResultCode};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Byte stream a session can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Type-erased stream so plain and TLS connections share one session type.
pub type BoxedIo = Box<dyn Io>;

/// Errors raised by [`FrameReader`] and [`FrameWriter`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The read deadline passed before a frame arrived.
    #[error("read deadline expired")]
    Timeout,

    /// The peer closed the connection or the session was already closed.
    #[error("connection closed")]
    Closed,

    /// The WebSocket layer failed.
    #[error("websocket: {0}")]
    WebSocket(tungstenite::Error),

    /// A control message could not be serialized.
    #[error("encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::WebSocket(other),
        }
    }
}

/// A data frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A control message.
    Text(String),
    /// File bytes or process output.
    Binary(Vec<u8>),
}

/// Splits a WebSocket into independent write and read halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (FrameWriter<S>, FrameReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (
        FrameWriter {
            sink,
            closed: false,
        },
        FrameReader {
            stream,
            deadline: None,
        },
    )
}

/// Write half of a session.
pub struct FrameWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

impl<S> FrameWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Serializes `msg` as JSON and sends it as one text frame.
    pub async fn send_control(&mut self, msg: &impl Serialize) -> Result<(), TransportError> {
        let text = serde_json::to_string(msg)?;
        self.send(Frame::Text(text)).await
    }

    /// Sends raw bytes as one binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.send(Frame::Binary(bytes)).await
    }

    /// Sends one frame and flushes it.
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.sink.send(msg).await?;
        Ok(())
    }

    /// Sends a close frame and shuts the sink down. Later calls do nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Close handshake did not complete");
        }
    }
}

/// Read half of a session.
pub struct FrameReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    deadline: Option<Instant>,
}

impl<S> FrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Bounds every following [`recv`](Self::recv) by `deadline`; `None`
    /// waits indefinitely.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Waits for the next text or binary frame.
    ///
    /// Ping and pong frames are skipped. A close frame or end of stream
    /// yields [`TransportError::Closed`].
    pub async fn recv(&mut self) -> Result<Frame, TransportError> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.next_frame())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => self.next_frame().await,
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => return Ok(Frame::Binary(bytes)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            }
        }
    }
}
