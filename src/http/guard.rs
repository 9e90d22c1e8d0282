//! Admission guard middleware.
//!
//! Every request passing through the guard is attributed to an identity,
//! checked against the limiter, and either forwarded to the inner handler or
//! answered directly with `429 Too Many Requests`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error};

use super::extract::{api_token, client_ip};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiter;
use crate::storage::Verdict;

/// Limit applied to the identity of the request.
pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Whole seconds until the window frees a slot or the block lifts.
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Message sent with every rejection.
pub const LIMIT_EXCEEDED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body of guard-generated error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub code: u16,
    pub timestamp: String,
}

impl ErrorBody {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: message.into(),
            code: status.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// State shared by every invocation of [`admission_guard`].
#[derive(Clone)]
pub struct AdmissionGuard {
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl AdmissionGuard {
    /// Create a guard over `limiter`; each check must finish within `timeout`.
    pub fn new(limiter: Arc<RateLimiter>, timeout: Duration) -> Self {
        Self { limiter, timeout }
    }

    /// Decide whether a request from `address`, optionally carrying `token`,
    /// may proceed.
    pub async fn admit(&self, address: IpAddr, token: Option<&str>) -> Result<Verdict> {
        let address = address.to_string();
        let check = self.limiter.check(&address, token.unwrap_or_default());
        tokio::time::timeout(self.timeout, check).await?
    }
}

/// Middleware entry point, installed with
/// `axum::middleware::from_fn_with_state(guard, admission_guard)`.
pub async fn admission_guard(
    State(guard): State<AdmissionGuard>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let address = client_ip(request.headers(), peer);
    let token = api_token(request.headers());

    let verdict = match guard.admit(address, token.as_deref()).await {
        Ok(verdict) => verdict,
        Err(e) => return failure_response(&e),
    };

    if !verdict.allowed {
        debug!(
            address = %address,
            path = %request.uri().path(),
            retry_after = ?verdict.retry_after,
            "Request rejected"
        );
        return rejection_response(&verdict);
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &verdict);
    response
}

fn rejection_response(verdict: &Verdict) -> Response {
    let status = StatusCode::TOO_MANY_REQUESTS;
    let mut response = (status, Json(ErrorBody::new(status, LIMIT_EXCEEDED_MESSAGE))).into_response();
    let headers = response.headers_mut();
    apply_rate_limit_headers(headers, verdict);
    headers.insert(RETRY_AFTER, HeaderValue::from(whole_seconds(verdict.retry_after).max(1)));
    response
}

/// Fail closed: any limiter error answers 500 without reaching the handler.
fn failure_response(err: &TurnstileError) -> Response {
    error!(error = %err, "Rate limit check failed");
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    (status, Json(ErrorBody::new(status, "Internal server error"))).into_response()
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(verdict.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(verdict.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(whole_seconds(verdict.reset_after)));
}

/// Round a duration up to whole seconds.
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
