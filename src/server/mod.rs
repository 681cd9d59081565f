//! The HTTP application each worker serves.
//!
//! A small service that reports which worker answered, so the cluster's
//! distribution and restarts can be observed from outside.
//!
//! ```bash
//! herd --cluster --workers 4 --listen :8080
//! curl http://localhost:8080/        # Hello from worker 3 (pid 41235)
//! curl http://localhost:8080/health  # {"status":"ok","worker_id":3,...}
//! ```

pub mod error;
pub mod middleware;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::Uri,
    middleware::from_fn,
    routing::get,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info, info_span};

use self::error::ApiError;
use self::middleware::request_id_middleware;
use crate::cluster::{self, ClusterOptions};
use crate::error::Result;

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Cluster worker ID, `None` when not clustered.
    pub worker_id: Option<u32>,
    pub pid: u32,
    started: Instant,
}

impl AppState {
    pub fn new(worker_id: Option<u32>) -> Self {
        Self {
            worker_id,
            pid: std::process::id(),
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub worker_id: Option<u32>,
    pub pid: u32,
    pub uptime_secs: u64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index(State(state): State<Arc<AppState>>) -> String {
    match state.worker_id {
        Some(id) => format!("Hello from worker {} (pid {})\n", id, state.pid),
        None => format!("Hello from pid {}\n", state.pid),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        worker_id: state.worker_id,
        pid: state.pid,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("No route for {}", uri.path()))
}

/// Serve the application until SIGINT or SIGTERM, then finish in-flight
/// requests and return.
pub async fn run_server(options: &ClusterOptions) -> Result<()> {
    let worker_id = cluster::current_worker()?.map(|w| w.id);
    let span = match worker_id {
        Some(id) => info_span!("worker", id),
        None => info_span!("server"),
    };

    async move {
        let listener = cluster::bind_listener(options).await?;
        let addr = listener.local_addr()?;
        let app = build_router(Arc::new(AppState::new(worker_id)));

        info!(%addr, pid = std::process::id(), "Listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(cluster::shutdown_requested())
            .await?;
        info!("Server stopped");
        Ok(())
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(worker_id: Option<u32>) -> Router {
        build_router(Arc::new(AppState::new(worker_id)))
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_index_names_the_worker() {
        let (status, body) = get_body(app(Some(3)), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("Hello from worker 3 (pid "));
    }

    #[tokio::test]
    async fn test_index_outside_cluster() {
        let (_, body) = get_body(app(None), "/").await;
        assert!(body.starts_with("Hello from pid "));
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body(app(Some(1)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["worker_id"], 1);
        assert_eq!(json["pid"], std::process::id());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, body) = get_body(app(None), "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("NOT_FOUND"));
    }
}
