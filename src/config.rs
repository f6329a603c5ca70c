//! Runtime configuration for server and client mode.
//!
//! Built once in `main` from command-line arguments and passed by value into
//! [`crate::server::Server`] and [`crate::client::Client`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::transport::CommandKind;

/// Paths to the PEM files of one side of a mutual-TLS pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// CA certificate both sides trust.
    pub ca: PathBuf,
    /// This side's certificate chain.
    pub cert: PathBuf,
    /// This side's private key.
    pub key: PathBuf,
}

impl TlsFiles {
    /// `ca.cert.pem`, `server.cert.pem`, `server.key.pem` under `dir`.
    pub fn server(dir: &Path) -> Self {
        Self::for_role(dir, "server")
    }

    /// `ca.cert.pem`, `client.cert.pem`, `client.key.pem` under `dir`.
    pub fn client(dir: &Path) -> Self {
        Self::for_role(dir, "client")
    }

    fn for_role(dir: &Path, role: &str) -> Self {
        Self {
            ca: dir.join("ca.cert.pem"),
            cert: dir.join(format!("{role}.cert.pem")),
            key: dir.join(format!("{role}.key.pem")),
        }
    }
}

/// Settings for `appdeploy --listen`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:8080`.
    pub listen: String,

    /// TLS material; `None` serves plain WebSocket.
    pub tls: Option<TlsFiles>,

    /// Interval between active-connection log lines.
    pub stats_interval: Duration,
}

impl ServerConfig {
    /// Server settings with TLS enabled when `cert_dir` is given.
    pub fn new(listen: impl Into<String>, cert_dir: Option<&Path>) -> Self {
        Self {
            listen: listen.into(),
            tls: cert_dir.map(TlsFiles::server),
            stats_interval: Duration::from_secs(30),
        }
    }
}

/// What the client asks the server to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation to perform.
    pub cmd: CommandKind,
    /// Local file or directory to upload.
    pub source: Option<PathBuf>,
    /// Remote path (upload) or script text (shell, popen).
    pub target: String,
    /// Remote working directory for shell and popen.
    pub dir: String,
    /// Wait for a shell command to finish.
    pub wait: bool,
}

/// Settings for client mode.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, `ws://host:port/` or `wss://host:port/`.
    pub host: String,

    /// TLS material, required for `wss`.
    pub tls: Option<TlsFiles>,

    /// Deadline for the server's response; `None` waits forever.
    pub timeout: Option<Duration>,

    /// The operation to run.
    pub request: Request,
}

impl ClientConfig {
    /// Validates client settings.
    ///
    /// `timeout_secs == 0` disables the response deadline.
    pub fn new(
        host: impl Into<String>,
        cert_dir: Option<&Path>,
        timeout_secs: u64,
        request: Request,
    ) -> Result<Self> {
        let host = host.into();
        anyhow::ensure!(!host.is_empty(), "--host is required in client mode");

        let secure = host
            .get(..6)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("wss://"));
        anyhow::ensure!(
            !secure || cert_dir.is_some(),
            "--certdir is required for a wss:// host"
        );

        if request.cmd == CommandKind::Upload {
            anyhow::ensure!(request.source.is_some(), "--source is required for upload");
            anyhow::ensure!(!request.target.is_empty(), "--target is required for upload");
        }

        Ok(Self {
            host,
            tls: cert_dir.map(TlsFiles::client),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            request,
        })
    }
}
