//! Round-robin reverse proxy run by the master.
//!
//! Used where ports cannot be shared between processes. The master binds the
//! public address and forwards every request to one worker listening on
//! `127.0.0.1:<base_port + 100 + id>`. Failures become a 502; nothing is
//! retried against another worker.
//!
//! Request and response bodies are streamed in both directions, so upload size
//! is limited only by the worker. Connection upgrades are not proxied.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::TrafficDistributor;
use super::round_robin::{RoundRobinTable, Target};
use crate::cluster::options::internal_worker_addr;
use crate::cluster::spawn::WorkerHandle;
use crate::error::{ClusterError, Result};
use crate::server::error::ApiError;

/// Headers that describe a single hop and must not be forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// State shared by proxy request handlers.
#[derive(Debug)]
pub struct ProxyState {
    pub table: Arc<RoundRobinTable>,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(table: Arc<RoundRobinTable>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| ClusterError::ProxyServer(format!("building HTTP client: {}", e)))?;
        Ok(Self { table, client })
    }
}

/// Router that forwards every request to the next worker in `state.table`.
pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn forward(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let Some(target) = state.table.next() else {
        warn!("No live worker to proxy to");
        return ApiError::bad_gateway("no worker available").into_response();
    };

    match forward_to(&state.client, &target, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(worker_id = target.worker_id, error = %e, "Proxy request failed");
            ApiError::bad_gateway(format!("worker {} unavailable", target.worker_id))
                .into_response()
        }
    }
}

async fn forward_to(
    client: &reqwest::Client,
    target: &Target,
    request: Request,
) -> reqwest::Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", target.base_url, path);
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let headers = upstream_headers(parts.headers, peer);

    let upstream = client
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Request headers as sent to the worker.
fn upstream_headers(mut headers: HeaderMap, peer: Option<SocketAddr>) -> HeaderMap {
    strip_hop_by_hop(&mut headers);

    // The upstream Host is the worker; keep the original for the app
    if let Some(host) = headers.remove(header::HOST) {
        headers.insert(X_FORWARDED_HOST.clone(), host);
    }
    if let Some(peer) = peer {
        let forwarded = match headers
            .get(&X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) => format!("{}, {}", prior, peer.ip()),
            None => peer.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }
    headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));
    headers
}

/// Targets for every live worker that has an internal address, ordered by id.
pub fn targets_for(live: &[&WorkerHandle]) -> Vec<Target> {
    let mut targets: Vec<Target> = live
        .iter()
        .filter_map(|w| w.internal_addr.as_deref().map(|addr| Target::new(w.id, addr)))
        .collect();
    targets.sort_by_key(|t| t.worker_id);
    targets
}

/// Distributor where the master proxies requests round robin.
pub struct RoundRobinProxy {
    listen: SocketAddr,
    table: Arc<RoundRobinTable>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl RoundRobinProxy {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            table: Arc::new(RoundRobinTable::default()),
            shutdown: None,
            server: None,
        }
    }

    pub fn table(&self) -> Arc<RoundRobinTable> {
        Arc::clone(&self.table)
    }
}

#[async_trait]
impl TrafficDistributor for RoundRobinProxy {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn worker_address(&self, id: u32) -> Result<Option<String>> {
        internal_worker_addr(self.listen.port(), id).map(|addr| Some(addr.to_string()))
    }

    async fn start(&mut self, errors: mpsc::Sender<ClusterError>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen)
            .await
            .map_err(|e| ClusterError::Bind {
                addr: self.listen.to_string(),
                source: e,
            })?;
        let app = proxy_router(Arc::new(ProxyState::new(self.table())?));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
            if let Err(e) = result {
                let _ = errors.send(ClusterError::ProxyServer(e.to_string())).await;
            }
        });

        info!(listen = %self.listen, "Proxy listening");
        self.shutdown = Some(shutdown_tx);
        self.server = Some(server);
        Ok(())
    }

    fn workers_changed(&self, live: &[&WorkerHandle]) {
        self.table.replace(targets_for(live));
    }

    async fn drain(&mut self, deadline: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let Some(mut server) = self.server.take() else {
            return;
        };
        if tokio::time::timeout(deadline, &mut server).await.is_err() {
            warn!(
                deadline_secs = deadline.as_secs(),
                "Proxy did not drain in time, dropping open connections"
            );
            server.abort();
        } else {
            info!("Proxy drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request as HttpRequest, StatusCode};
    use axum::extract::DefaultBodyLimit;
    use axum::routing::{get, post};
    use tower::ServiceExt;

    async fn spawn_backend(name: &'static str) -> SocketAddr {
        let app = Router::new()
            .route("/who", get(move || async move { name }))
            .route(
                "/echo",
                post(|headers: HeaderMap, body: String| async move {
                    let host = headers
                        .get("x-forwarded-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    format!("{}|{}", host, body)
                }),
            )
            .route(
                "/size",
                post(|body: axum::body::Bytes| async move { body.len().to_string() }),
            )
            .layer(DefaultBodyLimit::disable());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn state_for(targets: Vec<Target>) -> Arc<ProxyState> {
        Arc::new(ProxyState::new(Arc::new(RoundRobinTable::new(targets))).unwrap())
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_requests_alternate_between_workers() {
        let a = spawn_backend("a").await;
        let b = spawn_backend("b").await;
        let app = proxy_router(state_for(vec![
            Target::new(1, &a.to_string()),
            Target::new(2, &b.to_string()),
        ]));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let response = app
                .clone()
                .oneshot(HttpRequest::builder().uri("/who").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            seen.push(body_string(response).await);
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_forwards_method_body_and_host() {
        let a = spawn_backend("a").await;
        let app = proxy_router(state_for(vec![Target::new(1, &a.to_string())]));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header(header::HOST, "example.test")
                    .body(Body::from("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "example.test|ping");
    }

    #[tokio::test]
    async fn test_large_upload_is_streamed_to_worker() {
        let a = spawn_backend("a").await;
        let app = proxy_router(state_for(vec![Target::new(1, &a.to_string())]));
        let size = 33 * 1024 * 1024;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri("/size")
                    .body(Body::from(vec![b'x'; size]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, size.to_string());
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_bad_gateway() {
        // Bind then drop to get a port nobody listens on
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let app = proxy_router(state_for(vec![Target::new(3, &dead.to_string())]));

        let response = app
            .oneshot(HttpRequest::builder().uri("/who").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_empty_table_is_bad_gateway() {
        let app = proxy_router(state_for(Vec::new()));
        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_upstream_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("site.test"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        let out = upstream_headers(headers, Some("192.168.1.5:5000".parse().unwrap()));
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert_eq!(out["x-forwarded-host"], "site.test");
        assert_eq!(out["x-forwarded-for"], "10.0.0.1, 192.168.1.5");
        assert_eq!(out["x-forwarded-proto"], "http");
        assert_eq!(out["x-custom"], "kept");
    }

    #[test]
    fn test_targets_for_skips_workers_without_address() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let w2 = WorkerHandle::new(2, 20, Some("127.0.0.1:8182".into()), tx.clone());
        let w1 = WorkerHandle::new(1, 10, Some("127.0.0.1:8181".into()), tx.clone());
        let w3 = WorkerHandle::new(3, 30, None, tx);

        let targets = targets_for(&[&w2, &w1, &w3]);
        let ids: Vec<u32> = targets.iter().map(|t| t.worker_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_worker_address_uses_offset() {
        let proxy = RoundRobinProxy::new("0.0.0.0:8080".parse().unwrap());
        assert_eq!(
            proxy.worker_address(3).unwrap().as_deref(),
            Some("127.0.0.1:8183")
        );
    }

    #[tokio::test]
    async fn test_workers_changed_rebuilds_table() {
        let proxy = RoundRobinProxy::new("127.0.0.1:0".parse().unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let w1 = WorkerHandle::new(1, 10, Some("127.0.0.1:8101".into()), tx.clone());
        let w2 = WorkerHandle::new(2, 20, Some("127.0.0.1:8102".into()), tx);

        proxy.workers_changed(&[&w1, &w2]);
        assert_eq!(proxy.table().len(), 2);
        proxy.workers_changed(&[&w1]);
        for _ in 0..4 {
            assert_eq!(proxy.table().next().unwrap().worker_id, 1);
        }
    }

    #[tokio::test]
    async fn test_start_and_drain() {
        let mut proxy = RoundRobinProxy::new("127.0.0.1:0".parse().unwrap());
        let (tx, _rx) = mpsc::channel(1);
        proxy.start(tx).await.expect("bind ephemeral port");
        proxy.drain(Duration::from_secs(1)).await;
        assert!(proxy.server.is_none());
    }
}
