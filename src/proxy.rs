use crate::access::{AccessPolicyStore, Decision};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::shutdown;
use crate::watchdog::Watchdog;
use base64::Engine;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use sha1::{Digest, Sha1};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Fixed GUID from RFC 6455 used to derive `Sec-WebSocket-Accept`
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket close code for a policy violation
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_REASON: &str = "access denied";

/// Largest upgrade response head accepted from the backend
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// How long the backend gets to answer an upgrade request
const UPGRADE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size of each tunnel pump
const TUNNEL_BUFFER: usize = 8 * 1024;

/// State shared by every connection handler
struct Gateway {
    access: Arc<AccessPolicyStore>,
    watchdog: Arc<dyn Watchdog>,
    pool: Arc<ConnectionPool>,
    request_timeout: Option<Duration>,
}

/// The access-gated reverse proxy in front of the backend
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        target: SocketAddr,
        access: Arc<AccessPolicyStore>,
        watchdog: Arc<dyn Watchdog>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, target, access, watchdog, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        target: SocketAddr,
        access: Arc<AccessPolicyStore>,
        watchdog: Arc<dyn Watchdog>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            gateway: Arc::new(Gateway {
                access,
                watchdog,
                pool: Arc::new(ConnectionPool::new(target, pool_config)),
                request_timeout: None,
            }),
            shutdown_rx,
        }
    }

    /// Fail forwarded requests with 504 after `timeout`
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(gateway) = Arc::get_mut(&mut self.gateway) {
            gateway.request_timeout = timeout;
        }
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.gateway.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            target = %self.gateway.pool.target(),
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown::requested(&mut shutdown_rx) => {
                    info!("Gateway shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// IPv4-mapped IPv6 callers are recorded under their IPv4 address
pub fn caller_ip(addr: SocketAddr) -> IpAddr {
    match addr.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        ip => ip,
    }
}

async fn admit(access: &Arc<AccessPolicyStore>, ip: IpAddr) -> bool {
    let access = Arc::clone(access);
    let address = ip.to_string();
    let decision = tokio::task::spawn_blocking(move || access.decide(&address)).await;

    match decision {
        Ok(Ok(Decision::Allowed)) => true,
        Ok(Ok(Decision::Denied)) => false,
        Ok(Err(e)) => {
            error!(%ip, error = %e, "Access store failed, denying");
            false
        }
        Err(e) => {
            error!(%ip, error = %e, "Access decision task failed, denying");
            false
        }
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let ip = caller_ip(client_addr);
    let upgrade = is_upgrade_request(&req);

    if !admit(&gateway.access, ip).await {
        debug!(%ip, method = %req.method(), uri = %req.uri(), upgrade, "Request denied");
        gateway.watchdog.security_event(ip, "request from unapproved caller");

        if upgrade {
            return Ok(deny_upgrade(req));
        }
        return Ok(json_error_response(
            ProxyErrorCode::AccessDenied,
            "Access has not been granted to this device",
        ));
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if upgrade {
        return handle_upgrade(req, gateway, ip, request_id).await;
    }

    // Overwritten rather than appended: this gateway is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(%ip, method = %req.method(), uri = %req.uri(), request_id, "Forwarding request");

    let forward = gateway.pool.send_request(req);
    let result = match gateway.request_timeout {
        Some(limit) => match tokio::time::timeout(limit, forward).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id, timeout_secs = limit.as_secs(), "Request timed out");
                gateway.watchdog.proxy_failure("request timed out");
                return Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", limit.as_secs()),
                ));
            }
        },
        None => forward.await,
    };

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            // Detail stays in the log
            warn!(request_id, error = %e, "Failed to forward request");
            if e.is_backend_failure() {
                gateway.watchdog.proxy_failure(&e.to_string());
            }
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// `Sec-WebSocket-Accept` for a client key
pub fn websocket_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Unmasked server close frame carrying `code` and `reason`
pub fn close_frame(code: u16, reason: &str) -> Vec<u8> {
    let reason = &reason.as_bytes()[..reason.len().min(123)];
    let mut frame = Vec::with_capacity(4 + reason.len());
    frame.push(0x88); // FIN + close opcode
    frame.push((2 + reason.len()) as u8);
    frame.extend_from_slice(&code.to_be_bytes());
    frame.extend_from_slice(reason);
    frame
}

/// Denied upgrade: WebSockets are accepted and closed with 1008 so browser
/// clients see a policy close; anything else gets a plain 403
fn deny_upgrade(req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let is_websocket = get_upgrade_type(&req).as_deref() == Some("websocket");
    let client_key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(client_key) = client_key.filter(|_| is_websocket) else {
        return json_error_response(
            ProxyErrorCode::UpgradeRejected,
            "Access has not been granted to this device",
        );
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut io = TokioIo::new(upgraded);
                let frame = close_frame(CLOSE_POLICY_VIOLATION, CLOSE_REASON);
                if let Err(e) = io.write_all(&frame).await {
                    debug!(error = %e, "Failed to send close frame");
                }
                let _ = io.shutdown().await;
            }
            Err(e) => {
                debug!(error = %e, "Denied upgrade never completed");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", websocket_accept_key(&client_key))
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Raw HTTP/1.1 upgrade request for the backend, with the same rewrites as
/// forwarded requests
fn build_upgrade_request<B>(req: &Request<B>, target: SocketAddr, caller: IpAddr) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        if name == hyper::header::HOST || name == X_FORWARDED_FOR || name == X_FORWARDED_PROTO {
            continue;
        }
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    request.extend_from_slice(format!("Host: {}\r\n", target).as_bytes());
    request.extend_from_slice(format!("X-Forwarded-For: {}\r\n", caller).as_bytes());
    request.extend_from_slice(b"X-Forwarded-Proto: http\r\n\r\n");
    request
}

/// Parse a response head: status line and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read up to the end of the response head. Bytes past it belong to the
/// upgraded stream and are returned separately.
async fn read_response_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn handle_upgrade(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    caller: IpAddr,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    let target = gateway.pool.target();
    debug!(%caller, request_id, upgrade_type, "Handling upgrade request");

    let connect_failed = |detail: String| {
        warn!(%target, request_id, error = %detail, "Upgrade to backend failed");
        gateway.watchdog.proxy_failure(&detail);
        Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to connect to backend",
        ))
    };

    let mut backend_stream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => return connect_failed(format!("connect: {}", e)),
    };
    let _ = backend_stream.set_nodelay(true);

    let raw_request = build_upgrade_request(&req, target, caller);
    if let Err(e) = backend_stream.write_all(&raw_request).await {
        return connect_failed(format!("send upgrade request: {}", e));
    }

    let (head, leftover) =
        match tokio::time::timeout(UPGRADE_RESPONSE_TIMEOUT, read_response_head(&mut backend_stream)).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => return connect_failed(format!("read upgrade response: {}", e)),
            Err(_) => return connect_failed("upgrade response timed out".to_string()),
        };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        return connect_failed("invalid upgrade response".to_string());
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(request_id, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(%caller, request_id, upgrade_type, "Upgrade accepted, opening tunnel");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    let watchdog = Arc::clone(&gateway.watchdog);
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade caller connection");
                return;
            }
        };

        let mut caller_io = TokioIo::new(upgraded);
        if !leftover.is_empty() {
            if let Err(e) = caller_io.write_all(&leftover).await {
                debug!(request_id, error = %e, "Caller gone before tunnel start");
                return;
            }
        }

        let stats = run_tunnel(caller_io, backend_stream).await;
        // A caller dropping its connection is an ordinary close
        if stats.target_error {
            watchdog.proxy_failure("tunnel dropped by backend");
        }
        debug!(
            request_id,
            caller_to_target = stats.caller_to_target,
            target_to_caller = stats.target_to_caller,
            caller_error = stats.caller_error,
            target_error = stats.target_error,
            "Tunnel closed"
        );
    });

    Ok(response)
}

/// Byte counts of a finished tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub caller_to_target: u64,
    pub target_to_caller: u64,
    /// An I/O error on the caller connection ended the tunnel
    pub caller_error: bool,
    /// An I/O error on the target connection ended the tunnel
    pub target_error: bool,
}

/// End of a tunnel an I/O error was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelEnd {
    Caller,
    Target,
}

/// Relay bytes both ways until both directions are done.
///
/// EOF on one side half-closes the other side's write half only. An I/O error
/// in either pump fires the shared close signal, which ends the other pump.
pub async fn run_tunnel<C, T>(caller: C, target: T) -> TunnelStats
where
    C: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    let (caller_read, caller_write) = tokio::io::split(caller);
    let (target_read, target_write) = tokio::io::split(target);
    let (close_tx, close_rx) = watch::channel(false);

    let (up, down) = tokio::join!(
        pump(
            (caller_read, TunnelEnd::Caller),
            (target_write, TunnelEnd::Target),
            &close_tx,
            close_rx.clone(),
        ),
        pump(
            (target_read, TunnelEnd::Target),
            (caller_write, TunnelEnd::Caller),
            &close_tx,
            close_rx,
        ),
    );
    let errored = |end| up.1 == Some(end) || down.1 == Some(end);

    TunnelStats {
        caller_to_target: up.0,
        target_to_caller: down.0,
        caller_error: errored(TunnelEnd::Caller),
        target_error: errored(TunnelEnd::Target),
    }
}

/// One direction of a tunnel. Returns bytes moved and the end that failed, if any.
async fn pump<R, W>(
    (mut reader, reader_end): (R, TunnelEnd),
    (mut writer, writer_end): (W, TunnelEnd),
    close_tx: &watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) -> (u64, Option<TunnelEnd>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUFFER];
    let mut moved = 0u64;

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = shutdown::requested(&mut close_rx) => return (moved, None),
        };

        let n = match read {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return (moved, None);
            }
            Ok(n) => n,
            Err(e) => {
                debug!(end = ?reader_end, error = %e, "Tunnel read failed");
                close_tx.send_replace(true);
                return (moved, Some(reader_end));
            }
        };

        let written = tokio::select! {
            written = writer.write_all(&buf[..n]) => written,
            _ = shutdown::requested(&mut close_rx) => return (moved, None),
        };
        if let Err(e) = written {
            debug!(end = ?writer_end, error = %e, "Tunnel write failed");
            close_tx.send_replace(true);
            return (moved, Some(writer_end));
        }
        moved += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[test]
    fn test_websocket_accept_key() {
        // Example handshake from RFC 6455 section 1.3
        assert_eq!(
            websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_close_frame() {
        let frame = close_frame(1008, "access denied");
        assert_eq!(frame[0], 0x88);
        assert_eq!(frame[1] as usize, 2 + "access denied".len());
        assert_eq!(&frame[2..4], &[0x03, 0xF0]);
        assert_eq!(&frame[4..], b"access denied");
    }

    #[test]
    fn test_caller_ip_unmaps_ipv4() {
        let mapped: SocketAddr = "[::ffff:192.168.1.20]:5000".parse().unwrap();
        assert_eq!(caller_ip(mapped), "192.168.1.20".parse::<IpAddr>().unwrap());

        let v6: SocketAddr = "[fe80::1]:5000".parse().unwrap();
        assert_eq!(caller_ip(v6), "fe80::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_build_upgrade_request_rewrites_headers() {
        let req = Request::builder()
            .method("GET")
            .uri("/rest/push?id=1")
            .header("Host", "gateway.local:8080")
            .header("X-Forwarded-For", "6.6.6.6")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .body(())
            .unwrap();

        let raw = build_upgrade_request(&req, "127.0.0.1:5678".parse().unwrap(), "192.168.1.5".parse().unwrap());
        let raw = String::from_utf8(raw).unwrap();

        assert!(raw.starts_with("GET /rest/push?id=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:5678\r\n"));
        assert!(raw.contains("X-Forwarded-For: 192.168.1.5\r\n"));
        assert!(raw.contains("X-Forwarded-Proto: http\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(!raw.contains("6.6.6.6"));
        assert!(!raw.contains("gateway.local"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_leftover() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\nearly-bytes")
            .await
            .unwrap();

        let (head, rest) = read_response_head(&mut client).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"early-bytes");
    }

    #[tokio::test]
    async fn test_tunnel_relays_and_half_closes() {
        let (caller, mut caller_peer) = tokio::io::duplex(64);
        let (target, mut target_peer) = tokio::io::duplex(64);

        let tunnel = tokio::spawn(run_tunnel(caller, target));

        caller_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Caller finishes sending; the target can still answer
        caller_peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        assert_eq!(target_peer.read_to_end(&mut rest).await.unwrap(), 0);

        target_peer.write_all(b"pong").await.unwrap();
        caller_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(target_peer);
        let stats = tokio::time::timeout(Duration::from_secs(5), tunnel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.caller_to_target, 4);
        assert_eq!(stats.target_to_caller, 4);
        assert!(!stats.caller_error);
        assert!(!stats.target_error);
    }

    /// Stream whose reads always fail
    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for Broken {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_caller_error_ends_tunnel_without_blaming_target() {
        // The target side stays open and silent; only the close signal can
        // end its pump
        let (target, _target_peer) = tokio::io::duplex(64);

        let stats = tokio::time::timeout(Duration::from_secs(5), run_tunnel(Broken, target))
            .await
            .expect("tunnel must finish after a pump error");
        assert!(stats.caller_error);
        assert!(!stats.target_error);
        assert_eq!(stats.caller_to_target, 0);
    }

    #[tokio::test]
    async fn test_target_error_is_attributed_to_target() {
        let (caller, _caller_peer) = tokio::io::duplex(64);

        let stats = tokio::time::timeout(Duration::from_secs(5), run_tunnel(caller, Broken))
            .await
            .expect("tunnel must finish after a pump error");
        assert!(stats.target_error);
        assert!(!stats.caller_error);
    }
}
