//! Server mode: accept loop, TLS and WebSocket handshakes, one
//! [`Connection`] task per client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::executor::Executor;
use crate::transport::{tls, BoxedIo};

/// Bound on the TLS and WebSocket handshakes of a new connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deploy server.
pub struct Server<E> {
    config: ServerConfig,
    executor: Arc<E>,
    active: Arc<AtomicUsize>,
}

impl<E: Executor> Server<E> {
    /// Creates a server that runs commands through `executor`.
    pub fn new(config: ServerConfig, executor: Arc<E>) -> Self {
        Self {
            config,
            executor,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of connections currently being served.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Binds the configured address and serves until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves `listener` until `shutdown` completes.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let acceptor = self
            .config
            .tls
            .as_ref()
            .map(tls::acceptor)
            .transpose()
            .context("Failed to load server TLS material")?;

        info!(
            addr = %listener.local_addr().context("Failed to read listen address")?,
            tls = acceptor.is_some(),
            "Listening"
        );

        let period = self.config.stats_interval;
        let mut stats = time::interval_at(Instant::now() + period, period);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(active = self.active(), "Shutting down, no longer accepting");
                    return Ok(());
                }
                _ = stats.tick() => {
                    info!(active = self.active(), "Active connections");
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => self.spawn_connection(tcp, peer, acceptor.clone()),
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }

    fn spawn_connection(&self, tcp: TcpStream, peer: SocketAddr, acceptor: Option<TlsAcceptor>) {
        let executor = Arc::clone(&self.executor);
        let active = ActiveGuard::new(Arc::clone(&self.active));
        debug!(%peer, "Accepted");

        tokio::spawn(async move {
            let _active = active;
            if let Some(ws) = handshake(tcp, peer, acceptor).await {
                Connection::new(ws, executor, peer.to_string()).run().await;
            }
        });
    }
}

/// TLS (when configured) then WebSocket upgrade, each bounded in time.
async fn handshake(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> Option<WebSocketStream<BoxedIo>> {
    let stream: BoxedIo = match acceptor {
        Some(acceptor) => match time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
            Ok(Ok(tls)) => Box::new(tls),
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "TLS handshake failed");
                return None;
            }
            Err(_) => {
                warn!(%peer, "TLS handshake timed out");
                return None;
            }
        },
        None => Box::new(tcp),
    };

    match time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => Some(ws),
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            None
        }
        Err(_) => {
            warn!(%peer, "WebSocket handshake timed out");
            None
        }
    }
}

/// Counts a connection as active for as long as it lives.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
