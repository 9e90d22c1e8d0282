//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::guard::{admission_guard, AdmissionGuard};
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// HTTP server exposing guarded API routes and an unguarded health probe.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Deadline for a single admission check
    request_timeout: Duration,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, request_timeout: Duration) -> Self {
        Self {
            addr,
            rate_limiter,
            request_timeout,
        }
    }

    /// Build the application router.
    pub fn router(&self) -> Router {
        router(self.rate_limiter.clone(), self.request_timeout)
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have finished.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

/// Build the router: `/health` plus the guarded `/api/v1` routes.
pub fn router(rate_limiter: Arc<RateLimiter>, request_timeout: Duration) -> Router {
    let guard = AdmissionGuard::new(rate_limiter.clone(), request_timeout);

    let api = Router::new()
        .route("/api/v1/users", get(users))
        .route("/api/v1/orders", get(orders))
        .route_layer(middleware::from_fn_with_state(guard, admission_guard));

    Router::new()
        .route("/health", get(health))
        .with_state(rate_limiter)
        .merge(api)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(rate_limiter): State<Arc<RateLimiter>>) -> impl IntoResponse {
    let timestamp = chrono::Utc::now().to_rfc3339();
    match rate_limiter.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "timestamp": timestamp })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "timestamp": timestamp })),
            )
        }
    }
}

async fn users() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Users endpoint",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn orders() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Orders endpoint",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
