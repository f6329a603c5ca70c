//! appdeploy
//!
//! One binary, two modes: `--listen` runs the deploy server, otherwise the
//! process acts as a client for a single upload or command and exits with
//! the outcome's code.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use appdeploy::client::{self, Client};
use appdeploy::config::{ClientConfig, Request, ServerConfig};
use appdeploy::executor::ShellExecutor;
use appdeploy::server::Server;
use appdeploy::transport::{CommandKind, Response};

#[derive(Parser, Debug)]
#[command(name = "appdeploy", version)]
#[command(about = "Upload files and run commands on a remote deploy server")]
struct Args {
    /// Server URL in client mode, e.g. ws://10.0.0.5:8080/ or wss://...
    #[arg(long, env = "APPDEPLOY_HOST", default_value = "")]
    host: String,

    /// Address to listen on; runs the server when set
    #[arg(long, env = "APPDEPLOY_LISTEN")]
    listen: Option<String>,

    /// Local file or directory to upload
    #[arg(long, env = "APPDEPLOY_SOURCE")]
    source: Option<PathBuf>,

    /// Remote path for upload, script text for shell and popen
    #[arg(long, env = "APPDEPLOY_TARGET", default_value = "")]
    target: String,

    /// Remote working directory for shell and popen
    #[arg(long, env = "APPDEPLOY_DIR", default_value = "")]
    dir: String,

    /// Operation: upload, shell or popen
    #[arg(long, env = "APPDEPLOY_CMD", default_value = "")]
    cmd: String,

    /// Seconds to wait for the server's response (0 = no limit)
    #[arg(long, env = "APPDEPLOY_TIMEOUT", default_value_t = 0)]
    timeout: u64,

    /// Wait for a shell command to finish
    #[arg(long, env = "APPDEPLOY_WAIT")]
    wait: bool,

    /// Directory holding ca.cert.pem and the {server,client}.{cert,key}.pem pairs
    #[arg(long, env = "APPDEPLOY_CERTDIR")]
    certdir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "APPDEPLOY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stderr, so stdout carries only command output and the final response
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(listen) = args.listen {
        let config = ServerConfig::new(listen, args.certdir.as_deref());
        info!(listen = %config.listen, tls = config.tls.is_some(), "Starting server");
        let server = Server::new(config, Arc::new(ShellExecutor::new()));
        return server.run().await;
    }

    let request = Request {
        cmd: CommandKind::from(args.cmd.as_str()),
        source: args.source,
        target: args.target,
        dir: args.dir,
        wait: args.wait,
    };
    let config = ClientConfig::new(args.host, args.certdir.as_deref(), args.timeout, request)
        .context("Invalid client arguments")?;

    let code = match deploy(&config).await {
        Ok(resp) => {
            print!("{}", client::render(&resp));
            resp.exit_status()
        }
        Err(e) => {
            error!(error = %e, "Deploy failed");
            e.code().code()
        }
    };
    std::io::stdout().flush().context("Failed to flush stdout")?;
    std::process::exit(code);
}

async fn deploy(config: &ClientConfig) -> appdeploy::error::Result<Response> {
    let mut client = Client::connect(config).await?;
    let mut stdout = tokio::io::stdout();
    let resp = client.execute(&config.request, &mut stdout).await;
    client.close().await;
    resp
}
