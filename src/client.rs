//! Client mode: one session, one operation, one final [`Response`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::{ClientConfig, Request};
use crate::error::{DeployError, Result};
use crate::transfer;
use crate::transport::{
    self, tls, BoxedIo, Command, CommandKind, Frame, FrameReader, FrameWriter, Response,
    TransportError,
};

/// A connected client session.
pub struct Client<S = BoxedIo> {
    writer: FrameWriter<S>,
    reader: FrameReader<S>,
    timeout: Option<Duration>,
}

impl Client<BoxedIo> {
    /// Connects to `config.host`, over TLS when the scheme is `wss`.
    #[instrument(skip_all, fields(host = %config.host))]
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let request = config
            .host
            .as_str()
            .into_client_request()
            .map_err(TransportError::from)?;
        let (host, port, secure) = endpoint(request.uri());

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| TransportError::from(tungstenite::Error::Io(e)))?;
        debug!(port, secure, "TCP connected");

        let stream: BoxedIo = if secure {
            let files = config.tls.as_ref().ok_or_else(|| {
                DeployError::Certificate(anyhow::anyhow!("wss requires a certificate directory"))
            })?;
            let connector = tls::connector(files).map_err(DeployError::Certificate)?;
            let name = ServerName::try_from(host.clone()).map_err(|e| {
                DeployError::Certificate(anyhow::anyhow!("server name {host}: {e}"))
            })?;
            let tls = connector
                .connect(name, tcp)
                .await
                .map_err(|e| TransportError::from(tungstenite::Error::Io(e)))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let (ws, _) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(TransportError::from)?;
        info!("Connected");
        Ok(Self::from_ws(ws, config.timeout))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established WebSocket. `timeout` bounds each response read.
    pub fn from_ws(ws: WebSocketStream<S>, timeout: Option<Duration>) -> Self {
        let (writer, reader) = transport::split(ws);
        Self {
            writer,
            reader,
            timeout,
        }
    }

    /// Runs `req`, writing process output to `out` as it arrives.
    ///
    /// Returns the final response. A server-side failure is an `Ok` response
    /// with a non-zero result; `Err` means the client itself failed.
    pub async fn execute<W>(&mut self, req: &Request, out: &mut W) -> Result<Response>
    where
        W: AsyncWrite + Unpin,
    {
        if req.cmd != CommandKind::Upload {
            return self.run_command(req, out).await;
        }

        let source = req.source.as_deref().ok_or_else(|| DeployError::Source {
            path: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "no source given"),
        })?;
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| DeployError::Source {
                path: source.to_path_buf(),
                source: e,
            })?;

        if meta.is_dir() {
            self.upload_dir(source, &req.target, out).await
        } else {
            self.upload_file(source, &remote_path(&req.target), out).await
        }
    }

    /// Uploads one file and waits for the server's verdict.
    pub async fn upload_file<W>(
        &mut self,
        source: &Path,
        target: &str,
        out: &mut W,
    ) -> Result<Response>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = transfer::send_file(&mut self.writer, source, target).await?;
        let resp = self.read_response(out).await?;
        info!(
            source = %source.display(),
            target,
            bytes,
            result = ?resp.result,
            "Upload finished"
        );
        Ok(resp)
    }

    /// Uploads every regular file under `root`, keeping relative paths.
    ///
    /// Files go in name order. Stops at the first failure and returns its
    /// response; otherwise returns the last file's response.
    pub async fn upload_dir<W>(
        &mut self,
        root: &Path,
        target: &str,
        out: &mut W,
    ) -> Result<Response>
    where
        W: AsyncWrite + Unpin,
    {
        let files = collect_files(root, target)?;
        info!(root = %root.display(), files = files.len(), "Uploading directory");

        let mut last = Response::ok(format!("upload dir[{}] success, no files", root.display()));
        for (source, remote) in files {
            last = self.upload_file(&source, &remote, out).await?;
            if !last.result.is_ok() {
                warn!(
                    source = %source.display(),
                    result = ?last.result,
                    "Directory upload stopped"
                );
                break;
            }
        }
        Ok(last)
    }

    async fn run_command<W>(&mut self, req: &Request, out: &mut W) -> Result<Response>
    where
        W: AsyncWrite + Unpin,
    {
        let cmd = Command::process(
            req.cmd.clone(),
            req.target.as_str(),
            req.dir.as_str(),
            req.wait,
        );
        debug!(cmd = %cmd.cmd, script = %cmd.target, "Sending command");
        self.writer.send_control(&cmd).await?;
        self.read_response(out).await
    }

    /// Reads until the next text frame, copying binary frames to `out`.
    async fn read_response<W>(&mut self, out: &mut W) -> Result<Response>
    where
        W: AsyncWrite + Unpin,
    {
        self.reader
            .set_deadline(self.timeout.map(|timeout| Instant::now() + timeout));
        loop {
            match self.reader.recv().await? {
                Frame::Binary(bytes) => {
                    if let Err(e) = write_output(out, &bytes).await {
                        warn!(error = %e, "Could not write command output");
                    }
                }
                Frame::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| DeployError::Malformed(format!("{e}: {text}")));
                }
            }
        }
    }

    /// Closes the session.
    pub async fn close(mut self) {
        self.writer.close().await;
    }
}

async fn write_output<W: AsyncWrite + Unpin>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes).await?;
    out.flush().await
}

/// The block printed for a final response.
pub fn render(resp: &Response) -> String {
    format!(
        "Server response:\nResult: {}\nExitCode: {}\nMessage: {}\n",
        resp.result.code(),
        resp.exit_code,
        resp.message
    )
}

/// Host, port and TLS flag of a `ws`/`wss` URL.
///
/// IPv6 literals lose their brackets so they can be dialed and used as a
/// TLS server name.
fn endpoint(uri: &Uri) -> (String, u16, bool) {
    let secure = uri
        .scheme_str()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("wss"));
    let host = uri.host().unwrap_or_default();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_owned();
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
    (host, port, secure)
}

/// Remote paths always use `/`.
fn remote_path(target: &str) -> String {
    target.replace(std::path::MAIN_SEPARATOR, "/")
}

/// Regular files under `root` in name order, paired with their remote path.
fn collect_files(root: &Path, target: &str) -> Result<Vec<(PathBuf, String)>> {
    let base = remote_path(target);
    let base = base.trim_end_matches('/');

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or_else(|_| entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let remote = if base.is_empty() {
            rel
        } else {
            format!("{base}/{rel}")
        };
        files.push((entry.into_path(), remote));
    }
    Ok(files)
}
