//! Integration tests for Flowgate
//!
//! Every test runs the gateway on an ephemeral port in front of a small raw
//! TCP backend. Test connections originate from 127.0.0.1, so that is the
//! caller address the access store sees.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowgate::access::{AccessPolicyStore, AccessStatus};
use flowgate::admin::AdminServer;
use flowgate::config::{BackendConfig, PathsConfig, RuntimeConfig, SupervisorConfig};
use flowgate::process::ProcessSupervisor;
use flowgate::proxy::{websocket_accept_key, ProxyServer};
use flowgate::runtime::RuntimeInstaller;
use flowgate::secrets::FileKeyProvider;
use flowgate::watchdog::Watchdog;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const LOCALHOST: &str = "127.0.0.1";

/// Watchdog that only records what it was told
#[derive(Default)]
struct RecordingWatchdog {
    security: Mutex<Vec<IpAddr>>,
    proxy_failures: Mutex<Vec<String>>,
}

impl Watchdog for RecordingWatchdog {
    fn process_failed(&self, _exit_code: i32) {}

    fn security_event(&self, address: IpAddr, _detail: &str) {
        self.security.lock().unwrap().push(address);
    }

    fn proxy_failure(&self, detail: &str) {
        self.proxy_failures.lock().unwrap().push(detail.to_string());
    }
}

/// Backend answering every request with a fixed body and reporting the
/// request head it received
async fn spawn_backend(body: impl Into<String>) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let body: Arc<str> = body.into().into();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let body = Arc::clone(&body);
            tokio::spawn(async move {
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                let _ = tx.send(head);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Backend that accepts any upgrade and then echoes bytes back
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_none() {
                    return;
                }
                let response = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n";
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Read up to and including the blank line ending a request head
async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => buf.push(byte[0]),
            _ => return None,
        }
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// An address nothing listens on
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

struct Gateway {
    addr: SocketAddr,
    access: Arc<AccessPolicyStore>,
    watchdog: Arc<RecordingWatchdog>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway(target: SocketAddr) -> Gateway {
    let access = Arc::new(AccessPolicyStore::open_in_memory().unwrap());
    let watchdog = Arc::new(RecordingWatchdog::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(addr, target, Arc::clone(&access), watchdog.clone(), shutdown_rx);
    tokio::spawn(server.serve(listener));

    Gateway {
        addr,
        access,
        watchdog,
        _shutdown_tx: shutdown_tx,
    }
}

/// Send a raw request and read until the server closes the connection
async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: gateway.example\r\nConnection: close\r\n\r\n",
        path
    );
    raw_request(addr, &request).await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_allowed_caller_is_forwarded() {
    let (backend, mut seen) = spawn_backend("hello from backend").await;
    let gateway = start_gateway(backend).await;
    gateway.access.allow(LOCALHOST).unwrap();

    let response = http_get(gateway.addr, "/api/items?page=2").await;
    assert_eq!(status_of(&response), 200, "response: {}", response);
    assert!(response.ends_with("hello from backend"));

    let head = seen.recv().await.unwrap().to_lowercase();
    assert!(head.starts_with("get /api/items?page=2 http/1.1"));
    assert!(head.contains(&format!("host: {}", backend)));
    assert!(head.contains("x-forwarded-for: 127.0.0.1"));
    assert!(head.contains("x-forwarded-proto: http"));
    assert!(head.contains("x-request-id: "));
    assert!(!head.contains("gateway.example"));
}

#[tokio::test]
async fn test_large_body_arrives_intact() {
    // Several relay frames worth of distinguishable content
    let body: String = (0..40_000u32).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let (backend, _seen) = spawn_backend(body.clone()).await;
    let gateway = start_gateway(backend).await;
    gateway.access.allow(LOCALHOST).unwrap();

    let response = http_get(gateway.addr, "/download").await;
    assert_eq!(status_of(&response), 200);
    let (_, received) = response.split_once("\r\n\r\n").unwrap();
    assert_eq!(received.len(), body.len());
    assert_eq!(received, body);
}

#[tokio::test]
async fn test_aborted_upload_is_not_a_proxy_failure() {
    // Backend that consumes the upload and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    let gateway = start_gateway(backend).await;
    gateway.access.allow(LOCALHOST).unwrap();

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nHost: gateway.example\r\nContent-Length: 100000\r\n\r\npartial")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stream);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(gateway.watchdog.proxy_failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_caller_is_held_for_approval() {
    let (backend, mut seen) = spawn_backend("secret").await;
    let gateway = start_gateway(backend).await;

    let response = http_get(gateway.addr, "/").await;
    assert_eq!(status_of(&response), 403);
    assert!(response.contains("ACCESS_DENIED"));
    assert!(!response.contains("secret"));

    let pending = gateway.access.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].address, LOCALHOST);
    assert_eq!(pending[0].status, AccessStatus::Pending);

    assert_eq!(gateway.watchdog.security.lock().unwrap().len(), 1);

    // Nothing reached the backend
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.try_recv().is_err());

    // Approval takes effect on the next request
    gateway.access.allow(LOCALHOST).unwrap();
    let response = http_get(gateway.addr, "/").await;
    assert_eq!(status_of(&response), 200);
    assert!(seen.recv().await.is_some());
}

#[tokio::test]
async fn test_blocked_caller_is_refused() {
    let (backend, mut seen) = spawn_backend("nope").await;
    let gateway = start_gateway(backend).await;
    gateway.access.block(LOCALHOST).unwrap();

    for _ in 0..3 {
        let response = http_get(gateway.addr, "/").await;
        assert_eq!(status_of(&response), 403);
    }

    // Still blocked, never downgraded to pending
    let entry = gateway.access.get(LOCALHOST).unwrap().unwrap();
    assert_eq!(entry.status, AccessStatus::Blocked);
    assert!(gateway.access.list_pending().unwrap().is_empty());
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_backend_down_returns_bad_gateway() {
    let gateway = start_gateway(dead_addr().await).await;
    gateway.access.allow(LOCALHOST).unwrap();

    let response = http_get(gateway.addr, "/").await;
    assert_eq!(status_of(&response), 502);
    assert!(response.contains("CONNECTION_FAILED"));
    assert_eq!(gateway.watchdog.proxy_failures.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upgrade_tunnel_relays_both_ways() {
    let backend = spawn_echo_backend().await;
    let gateway = start_gateway(backend).await;
    gateway.access.allow(LOCALHOST).unwrap();

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: gateway.example\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut stream).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);

    stream.write_all(b"ping over the tunnel").await.unwrap();
    let mut buf = vec![0u8; b"ping over the tunnel".len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(&buf, b"ping over the tunnel");
}

#[tokio::test]
async fn test_caller_reset_tunnel_is_not_a_proxy_failure() {
    let backend = spawn_echo_backend().await;
    let gateway = start_gateway(backend).await;
    gateway.access.allow(LOCALHOST).unwrap();

    for _ in 0..3 {
        let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
        stream
            .write_all(b"GET /stream HTTP/1.1\r\nHost: gateway.example\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await.unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("echo within timeout")
            .unwrap();

        // Closing with a zero linger sends RST instead of FIN
        #[allow(deprecated)]
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(stream);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(gateway.watchdog.proxy_failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_denied_websocket_is_closed_with_policy_code() {
    let (backend, mut seen) = spawn_backend("unused").await;
    let gateway = start_gateway(backend).await;

    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: gateway.example\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {}\r\n\r\n",
        key
    );

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);
    assert!(head
        .to_lowercase()
        .contains(&format!("sec-websocket-accept: {}", websocket_accept_key(key).to_lowercase())));

    let mut frame = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut frame))
        .await
        .expect("close frame within timeout")
        .unwrap();
    assert_eq!(frame[0], 0x88);
    assert_eq!(&frame[2..4], &1008u16.to_be_bytes());
    assert_eq!(&frame[4..], b"access denied");

    assert_eq!(gateway.access.list_pending().unwrap().len(), 1);
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_denied_non_websocket_upgrade_is_forbidden() {
    let backend = spawn_echo_backend().await;
    let gateway = start_gateway(backend).await;

    let response = raw_request(
        gateway.addr,
        "GET / HTTP/1.1\r\nHost: gateway.example\r\nConnection: Upgrade, close\r\nUpgrade: h2c\r\n\r\n",
    )
    .await;
    assert_eq!(status_of(&response), 403);
    assert!(response.contains("UPGRADE_REJECTED"));
}

struct Admin {
    addr: SocketAddr,
    access: Arc<AccessPolicyStore>,
    _tmp: tempfile::TempDir,
    _shutdown_tx: watch::Sender<bool>,
}

const TOKEN: &str = "test-admin-token";

async fn start_admin() -> Admin {
    let tmp = tempfile::tempdir().unwrap();
    let paths = PathsConfig {
        runtime_dir: Some(tmp.path().join("runtime")),
        data_dir: Some(tmp.path().join("data")),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let access = Arc::new(AccessPolicyStore::open_in_memory().unwrap());
    let installer = Arc::new(
        RuntimeInstaller::new(
            RuntimeConfig {
                release_index_url: "http://127.0.0.1:9/index.json".to_string(),
                ..RuntimeConfig::default()
            },
            paths.runtime_dir(),
            tmp.path().join("staging"),
            "server",
        )
        .unwrap(),
    );
    let supervisor = ProcessSupervisor::new(
        SupervisorConfig::default(),
        BackendConfig::default(),
        &paths,
        Arc::new(FileKeyProvider::new(paths.secret_file())),
        Arc::new(RecordingWatchdog::default()),
        installer,
        shutdown_rx.clone(),
    )
    .unwrap();

    let target = dead_addr().await;
    let pool = Arc::new(flowgate::pool::ConnectionPool::new(target, Default::default()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = AdminServer::new(
        addr,
        supervisor,
        Arc::clone(&access),
        pool,
        shutdown_rx,
        TOKEN.to_string(),
    );
    tokio::spawn(server.serve(listener));

    Admin {
        addr,
        access,
        _tmp: tmp,
        _shutdown_tx: shutdown_tx,
    }
}

async fn admin_request(addr: SocketAddr, method: &str, path: &str, token: Option<&str>) -> String {
    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, auth
    );
    raw_request(addr, &request).await
}

#[tokio::test]
async fn test_admin_requires_token() {
    let admin = start_admin().await;

    let response = admin_request(admin.addr, "GET", "/health", None).await;
    assert_eq!(status_of(&response), 200);

    let response = admin_request(admin.addr, "GET", "/access", None).await;
    assert_eq!(status_of(&response), 401);

    let response = admin_request(admin.addr, "GET", "/access", Some("wrong")).await;
    assert_eq!(status_of(&response), 401);

    let response = admin_request(admin.addr, "GET", "/access", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 200);
}

#[tokio::test]
async fn test_admin_approval_flow() {
    let admin = start_admin().await;
    admin.access.decide("10.1.2.3").unwrap();

    let response = admin_request(admin.addr, "GET", "/access/pending", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("10.1.2.3"));

    let response = admin_request(admin.addr, "POST", "/access/10.1.2.3/allow", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("\"allowed\""));
    assert!(admin.access.list_pending().unwrap().is_empty());

    let response = admin_request(admin.addr, "POST", "/access/10.1.2.3/block", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(
        admin.access.get("10.1.2.3").unwrap().unwrap().status,
        AccessStatus::Blocked
    );

    let response = admin_request(admin.addr, "DELETE", "/access/10.1.2.3", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 200);
    assert!(admin.access.get("10.1.2.3").unwrap().is_none());

    let response = admin_request(admin.addr, "GET", "/access/10.1.2.3", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 404);
}

#[tokio::test]
async fn test_admin_status_reports_stopped_server() {
    let admin = start_admin().await;

    let response = admin_request(admin.addr, "GET", "/status", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("\"state\":\"stopped\""), "response: {}", response);
    assert!(response.contains("\"runtime_installed\":false"));
    assert!(response.contains("\"reachable\":false"));
}

#[tokio::test]
async fn test_admin_lifecycle_requests_are_accepted() {
    let admin = start_admin().await;

    let response = admin_request(admin.addr, "POST", "/server/start", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 202, "response: {}", response);
    assert!(response.contains("\"state\""));

    let response = admin_request(admin.addr, "POST", "/server/restart", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 202, "response: {}", response);
    assert!(response.contains("\"state\""));

    let response = admin_request(admin.addr, "POST", "/server/stop", Some(TOKEN)).await;
    assert_eq!(status_of(&response), 200, "response: {}", response);
}

#[tokio::test]
async fn test_gateway_stops_accepting_after_shutdown() {
    let (backend, _seen) = spawn_backend("ok").await;
    let access = Arc::new(AccessPolicyStore::open_in_memory().unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(addr, backend, access, Arc::new(RecordingWatchdog::default()), shutdown_rx);
    let handle = tokio::spawn(server.serve(listener));

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server exits after shutdown")
        .unwrap();
    assert!(result.is_ok());
}
