use crate::access::AccessPolicyStore;
use crate::pool::ConnectionPool;
use crate::process::ProcessSupervisor;
use crate::shutdown;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Lines returned by `GET /logs` without a `lines` parameter
const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5_000;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message.to_string() }))
}

/// Everything the admin handlers act on
struct AdminContext {
    supervisor: Arc<ProcessSupervisor>,
    access: Arc<AccessPolicyStore>,
    pool: Arc<ConnectionPool>,
    auth_token: String,
}

/// Loopback control API: server lifecycle, logs and access approvals
pub struct AdminServer {
    bind_addr: SocketAddr,
    context: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<ProcessSupervisor>,
        access: Arc<AccessPolicyStore>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(AdminContext {
                supervisor,
                access,
                pool,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown::requested(&mut shutdown_rx) => {
                    info!("Admin server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, context: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        async move { handle_admin_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// `lines` query parameter, clamped
fn parse_lines(query: Option<&str>) -> usize {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("lines="))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LOG_LINES)
        .min(MAX_LOG_LINES)
}

/// Split `/access/{addr}[/{action}]`
fn access_route(path: &str) -> Option<(&str, Option<&str>)> {
    let rest = path.strip_prefix("/access/")?;
    match rest.split_once('/') {
        Some((addr, action)) => Some((addr, Some(action))),
        None => Some((rest, None)),
    }
}

async fn handle_admin_request(
    req: Request<Incoming>,
    context: Arc<AdminContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Liveness and version need no token
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            return Ok(json_response(
                StatusCode::OK,
                serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
            ));
        }
        _ => {}
    }

    if !check_auth(&req, &context.auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let supervisor = &context.supervisor;

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/status") => {
            let status = supervisor.status();
            let stats = context.pool.stats();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "server": status,
                    "backend": {
                        "address": context.pool.target().to_string(),
                        "reachable": context.pool.probe().await,
                        "forwarded_requests": stats.get_total_requests(),
                        "failed_requests": stats.get_failed_requests(),
                    },
                    "pending_approvals": context.access.list_pending().map(|p| p.len()).unwrap_or(0),
                }),
            )
        }

        (&Method::GET, "/logs") => {
            let lines = supervisor.log_tail(parse_lines(req.uri().query()));
            json_response(StatusCode::OK, serde_json::json!({ "count": lines.len(), "lines": lines }))
        }

        (&Method::GET, "/access") => match context.access.list_all() {
            Ok(entries) => json_response(StatusCode::OK, serde_json::json!({ "entries": entries })),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
        },

        (&Method::GET, "/access/pending") => match context.access.list_pending() {
            Ok(entries) => json_response(StatusCode::OK, serde_json::json!({ "entries": entries })),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
        },

        (&Method::POST, "/server/start") => {
            let starter = Arc::clone(supervisor);
            tokio::spawn(async move {
                let state = starter.start().await;
                info!(state = state.as_str(), "Start requested via admin API");
            });
            json_response(StatusCode::ACCEPTED, serde_json::json!({ "state": supervisor.state() }))
        }

        (&Method::POST, "/server/stop") => {
            supervisor.stop().await;
            json_response(StatusCode::OK, serde_json::json!({ "state": supervisor.state() }))
        }

        (&Method::POST, "/server/restart") => {
            let restarter = Arc::clone(supervisor);
            tokio::spawn(async move {
                let state = restarter.hard_restart().await;
                info!(state = state.as_str(), "Restart requested via admin API");
            });
            json_response(StatusCode::ACCEPTED, serde_json::json!({ "state": supervisor.state() }))
        }

        (method, path) => match access_route(path) {
            Some((addr, action)) => handle_access_change(&context.access, method, addr, action),
            None => response(StatusCode::NOT_FOUND, "not found"),
        },
    };

    Ok(response)
}

fn handle_access_change(
    access: &AccessPolicyStore,
    method: &Method,
    addr: &str,
    action: Option<&str>,
) -> Response<Full<Bytes>> {
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return json_error(StatusCode::BAD_REQUEST, format!("invalid address: {}", addr));
    };
    let address = ip.to_string();

    let result = match (method, action) {
        (&Method::POST, Some("allow")) => access.allow(&address).map(|_| true),
        (&Method::POST, Some("block")) => access.block(&address).map(|_| true),
        (&Method::DELETE, None) => access.forget(&address),
        (&Method::GET, None) => {
            return match access.get(&address) {
                Ok(Some(entry)) => json_response(StatusCode::OK, serde_json::json!(entry)),
                Ok(None) => json_error(StatusCode::NOT_FOUND, "unknown address"),
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
            };
        }
        _ => return response(StatusCode::NOT_FOUND, "not found"),
    };

    match result {
        Ok(true) => match access.get(&address) {
            Ok(Some(entry)) => json_response(StatusCode::OK, serde_json::json!(entry)),
            Ok(None) => json_response(StatusCode::OK, serde_json::json!({ "address": address, "removed": true })),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
        },
        Ok(false) => json_error(StatusCode::NOT_FOUND, "unknown address"),
        Err(e) => {
            error!(address, error = %e, "Access change failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lines() {
        assert_eq!(parse_lines(None), DEFAULT_LOG_LINES);
        assert_eq!(parse_lines(Some("lines=25")), 25);
        assert_eq!(parse_lines(Some("foo=1&lines=7")), 7);
        assert_eq!(parse_lines(Some("lines=abc")), DEFAULT_LOG_LINES);
        assert_eq!(parse_lines(Some("lines=999999")), MAX_LOG_LINES);
    }

    #[test]
    fn test_access_route() {
        assert_eq!(access_route("/access/10.0.0.5/allow"), Some(("10.0.0.5", Some("allow"))));
        assert_eq!(access_route("/access/10.0.0.5"), Some(("10.0.0.5", None)));
        assert_eq!(access_route("/status"), None);
    }

    #[test]
    fn test_access_change() {
        let access = AccessPolicyStore::open_in_memory().unwrap();

        let resp = handle_access_change(&access, &Method::POST, "192.168.1.9", Some("allow"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(access.decide("192.168.1.9").unwrap(), crate::access::Decision::Allowed);

        let resp = handle_access_change(&access, &Method::POST, "not-an-ip", Some("allow"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = handle_access_change(&access, &Method::DELETE, "192.168.1.9", None);
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = handle_access_change(&access, &Method::DELETE, "192.168.1.9", None);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = handle_access_change(&access, &Method::POST, "192.168.1.9", Some("explode"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
