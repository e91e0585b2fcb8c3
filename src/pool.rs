//! Pooled HTTP client for the backend
//!
//! All forwarded request/response traffic goes through one hyper client with
//! keep-alive pooling against the fixed loopback target. Response bodies are
//! re-framed so no single frame handed back to the caller exceeds
//! [`MAX_FRAME_BYTES`].

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Largest body frame relayed to the caller
pub const MAX_FRAME_BYTES: usize = 8 * 1024;

/// Connection-scoped headers that must not be forwarded on plain requests
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// Whether the backend side caused this error. Failures of the caller's
    /// own request body, such as an upload aborted midway, do not count.
    pub fn is_backend_failure(&self) -> bool {
        match self {
            PoolError::Client(e) => {
                let mut source = std::error::Error::source(e);
                while let Some(err) = source {
                    if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
                        if hyper_err.is_user() {
                            return false;
                        }
                    }
                    source = err.source();
                }
                true
            }
            PoolError::RequestBuild(_) => false,
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections to the backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled client bound to the backend address
pub struct ConnectionPool {
    target: SocketAddr,
    client: Client<HttpConnector, Incoming>,
    /// Separate client for reachability probes (Empty body type)
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(target: SocketAddr, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            %target,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            target,
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the backend. `Host` is forced to the target and
    /// hop-by-hop headers are dropped; everything else passes through.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = format!("http://{}{}", self.target, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if is_hop_by_hop(key) || key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }
        builder = builder.header(hyper::header::HOST, target_host(self.target));

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, BoundedChunks::new(body, MAX_FRAME_BYTES).boxed()))
    }

    /// Whether the backend answers HTTP at all (any status counts)
    pub async fn probe(&self) -> bool {
        let uri = format!("http://{}/", self.target);
        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header(hyper::header::HOST, target_host(self.target))
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.probe_client.request(req)).await,
            Ok(Ok(_))
        )
    }
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// `Host` value naming the backend
pub fn target_host(target: SocketAddr) -> HeaderValue {
    HeaderValue::from_str(&target.to_string()).unwrap_or_else(|_| HeaderValue::from_static("127.0.0.1"))
}

/// Body adapter splitting data frames larger than `max` bytes
pub struct BoundedChunks<B> {
    inner: B,
    pending: Option<Bytes>,
    max: usize,
}

impl<B> BoundedChunks<B> {
    pub fn new(inner: B, max: usize) -> Self {
        Self {
            inner,
            pending: None,
            max: max.max(1),
        }
    }

    fn next_piece(&mut self, mut data: Bytes) -> Bytes {
        if data.len() > self.max {
            let head = data.split_to(self.max);
            self.pending = Some(data);
            head
        } else {
            data
        }
    }
}

impl<B> Body for BoundedChunks<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(pending) = this.pending.take() {
            let piece = this.next_piece(pending);
            return Poll::Ready(Some(Ok(Frame::data(piece))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => {
                    let piece = this.next_piece(data);
                    Poll::Ready(Some(Ok(Frame::data(piece))))
                }
                // Trailers pass through untouched
                Err(frame) => Poll::Ready(Some(Ok(frame))),
            },
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let inner = self.inner.size_hint();
        let Some(pending) = &self.pending else {
            return inner;
        };
        let extra = pending.len() as u64;
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + extra);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + extra);
        }
        hint
    }
}
