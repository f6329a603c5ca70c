//! Client against a real server over loopback TCP.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use appdeploy::client::Client;
use appdeploy::config::{ClientConfig, Request, ServerConfig};
use appdeploy::executor::ShellExecutor;
use appdeploy::server::Server;
use appdeploy::transport::{CommandKind, Response, ResultCode};

struct Harness {
    addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(
            ServerConfig::new(addr.to_string(), None),
            Arc::new(ShellExecutor::new()),
        );
        let stop = CancellationToken::new();
        let shutdown = stop.clone().cancelled_owned();
        let task = tokio::spawn(async move { server.serve(listener, shutdown).await });
        Self { addr, stop, task }
    }

    /// Runs one request on a fresh connection, returning the response and
    /// everything streamed before it.
    async fn run(&self, request: Request) -> (Response, Vec<u8>) {
        let config = ClientConfig::new(format!("ws://{}/", self.addr), None, 30, request).unwrap();
        let mut client = Client::connect(&config).await.unwrap();
        let mut out = Vec::new();
        let resp = client.execute(&config.request, &mut out).await.unwrap();
        client.close().await;
        (resp, out)
    }

    async fn stop(self) {
        self.stop.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn upload(source: &Path, target: &Path) -> Request {
    Request {
        cmd: CommandKind::Upload,
        source: Some(source.to_path_buf()),
        target: target.to_str().unwrap().to_owned(),
        dir: String::new(),
        wait: false,
    }
}

#[cfg(unix)]
fn process(cmd: CommandKind, script: &str, wait: bool) -> Request {
    Request {
        cmd,
        source: None,
        target: script.to_owned(),
        dir: String::new(),
        wait,
    }
}

#[tokio::test]
async fn upload_creates_directories_and_file() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("a.txt");
    std::fs::write(&source, "hello world").unwrap();
    let target = tmp.path().join("out/a.txt");

    let server = Harness::start().await;
    let (resp, _) = server.run(upload(&source, &target)).await;

    assert_eq!(resp.result, ResultCode::Ok, "{}", resp.message);
    assert!(resp.message.contains(target.to_str().unwrap()));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello world");
    server.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn waited_shell_reports_exit_code() {
    let server = Harness::start().await;
    let (resp, out) = server.run(process(CommandKind::Shell, "exit 7", true)).await;

    assert_eq!(resp.result, ResultCode::Ok);
    assert_eq!(resp.exit_code, 7);
    assert_eq!(resp.exit_status(), 7);
    assert!(String::from_utf8_lossy(&out).contains("waiting for completion"));
    server.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn popen_streams_both_pipes() {
    let server = Harness::start().await;
    let (resp, out) = server
        .run(process(CommandKind::Popen, "echo A; echo B 1>&2", false))
        .await;

    assert_eq!(resp.result, ResultCode::Ok);
    assert_eq!(resp.exit_code, 0);
    let text = String::from_utf8(out).unwrap();
    let mut lines: Vec<_> = text.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, ["A", "B"]);
    server.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn connection_serves_commands_in_sequence() {
    let server = Harness::start().await;
    let config = ClientConfig::new(
        format!("ws://{}/", server.addr),
        None,
        30,
        process(CommandKind::Shell, "true", true),
    )
    .unwrap();
    let mut client = Client::connect(&config).await.unwrap();
    let mut out = Vec::new();

    for code in [3, 4] {
        let req = process(CommandKind::Shell, &format!("exit {code}"), true);
        let resp = client.execute(&req, &mut out).await.unwrap();
        assert_eq!(resp.exit_code, code);
    }
    client.close().await;
    server.stop().await;
}

/// Writes `a.txt`, `b.txt` and `c.txt`, each containing its own name.
fn tree(root: &Path) {
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(root.join(name), name).unwrap();
    }
}

#[tokio::test]
async fn directory_upload_preserves_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("local");
    std::fs::create_dir_all(local.join("nested")).unwrap();
    tree(&local);
    std::fs::write(local.join("nested/d.txt"), "d").unwrap();
    let remote = tmp.path().join("remote");

    let server = Harness::start().await;
    let (resp, _) = server.run(upload(&local, &remote)).await;

    assert_eq!(resp.result, ResultCode::Ok, "{}", resp.message);
    for name in ["a.txt", "b.txt", "c.txt"] {
        assert_eq!(std::fs::read_to_string(remote.join(name)).unwrap(), name);
    }
    assert_eq!(std::fs::read_to_string(remote.join("nested/d.txt")).unwrap(), "d");
    server.stop().await;
}

#[tokio::test]
async fn directory_upload_stops_at_failed_file() {
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("local");
    std::fs::create_dir_all(&local).unwrap();
    tree(&local);
    let remote = tmp.path().join("remote");
    // A directory where b.txt should go makes the second save fail.
    std::fs::create_dir_all(remote.join("b.txt")).unwrap();

    let server = Harness::start().await;
    let (resp, _) = server.run(upload(&local, &remote)).await;

    assert_eq!(resp.result, ResultCode::SaveFailed);
    assert!(resp.message.contains("b.txt"));
    assert_eq!(std::fs::read_to_string(remote.join("a.txt")).unwrap(), "a.txt");
    assert!(!remote.join("c.txt").exists());
    server.stop().await;
}
