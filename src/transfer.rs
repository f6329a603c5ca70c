//! Upload protocol: a [`Command`] declaring length and digest, followed by
//! raw binary frames that add up to exactly that length.
//!
//! The server accumulates the body in memory (bounded by
//! [`MAX_UPLOAD_BYTES`]), verifies the MD5 digest and only then writes the
//! file.

use std::path::Path;
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::transport::{
    Command, Frame, FrameReader, FrameWriter, Response, ResultCode, TransportError,
};

/// Largest upload the server accepts, in bytes.
pub const MAX_UPLOAD_BYTES: u64 = 512_000_000;

/// Size of each binary frame the client sends.
pub const CHUNK_SIZE: usize = 4096;

/// How long the server waits for each next chunk.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lowercase hex MD5 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Size and lowercase hex MD5 of a file, read in [`CHUNK_SIZE`] blocks.
pub async fn digest_file(path: &Path) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| DeployError::Source {
            path: path.to_path_buf(),
            source,
        })?;

    let mut hasher = Md5::new();
    let mut length = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|source| DeployError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        length += n as u64;
    }
    Ok((length, hex::encode(hasher.finalize())))
}

/// Server side: receives the body announced by `cmd` and stores it.
///
/// Always yields exactly one [`Response`]. Oversized declarations are
/// refused before any frame is read. The reader's deadline is cleared
/// before returning.
pub async fn receive<S>(reader: &mut FrameReader<S>, cmd: &Command) -> Response
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if cmd.length > MAX_UPLOAD_BYTES {
        warn!(target = %cmd.target, length = cmd.length, "Upload exceeds size limit");
        return Response::error(
            ResultCode::TooLarge,
            format!("file too big[{}], limit is {MAX_UPLOAD_BYTES}", cmd.length),
        );
    }

    let body = read_body(reader, cmd.length).await;
    reader.set_deadline(None);

    match body {
        Ok(body) => store(&cmd.target, &cmd.hash, &body).await,
        Err(resp) => resp,
    }
}

async fn read_body<S>(
    reader: &mut FrameReader<S>,
    length: u64,
) -> std::result::Result<Vec<u8>, Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    const INITIAL_CAPACITY: u64 = 1 << 20;

    #[allow(clippy::cast_possible_truncation)]
    let mut body = Vec::with_capacity(length.min(INITIAL_CAPACITY) as usize);

    while (body.len() as u64) < length {
        reader.set_deadline(Some(Instant::now() + CHUNK_TIMEOUT));
        match reader.recv().await {
            Ok(Frame::Binary(chunk)) => body.extend_from_slice(&chunk),
            Ok(Frame::Text(_)) => {
                return Err(Response::error(
                    ResultCode::Malformed,
                    "error packet type, expected binary frame",
                ));
            }
            Err(TransportError::Timeout) => {
                return Err(Response::error(
                    ResultCode::Timeout,
                    format!("upload stalled after {} of {length} bytes", body.len()),
                ));
            }
            Err(e) => {
                return Err(Response::error(ResultCode::Socket, format!("socket error: {e}")));
            }
        }
    }

    if body.len() as u64 > length {
        return Err(Response::error(
            ResultCode::Malformed,
            format!("received {} bytes, declared {length}", body.len()),
        ));
    }
    Ok(body)
}

async fn store(target: &str, hash: &str, body: &[u8]) -> Response {
    let actual = digest(body);
    if actual != hash {
        warn!(target, declared = hash, actual = %actual, "Upload digest mismatch");
        return Response::error(ResultCode::HashMismatch, "file hash mismatch!");
    }

    let path = Path::new(target);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return Response::error(
                ResultCode::SaveFailed,
                format!("create dir[{}] failed: {e}", parent.display()),
            );
        }
    }
    if let Err(e) = tokio::fs::write(path, body).await {
        return Response::error(
            ResultCode::SaveFailed,
            format!("write file[{target}] failed: {e}"),
        );
    }

    info!(target, bytes = body.len(), "Stored upload");
    Response::ok(format!("upload file[{target}] success"))
}

/// Client side: declares `source` as an upload to `target` and streams it.
///
/// Returns the number of bytes sent. The caller reads the response.
pub async fn send_file<S>(writer: &mut FrameWriter<S>, source: &Path, target: &str) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (length, hash) = digest_file(source).await?;
    writer
        .send_control(&Command::upload(target, length, hash))
        .await?;

    let mut file = tokio::fs::File::open(source)
        .await
        .map_err(|e| DeployError::Source {
            path: source.to_path_buf(),
            source: e,
        })?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(|e| DeployError::Read {
            path: source.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        writer.send_binary(buf[..n].to_vec()).await?;
        sent += n as u64;
    }

    info!(source = %source.display(), target, bytes = sent, "File sent, waiting for response");
    Ok(sent)
}
