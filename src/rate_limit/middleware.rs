//! HTTP admission middleware
//!
//! Wraps a route with [`RateLimiter::enforce_rate_limit`]. Denials become
//! `429 Too Many Requests`, a fail-closed store outage becomes
//! `503 Service Unavailable`, and admitted responses carry the
//! `X-RateLimit-*` headers of the most restrictive scope.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use super::limiter::RateLimiter;

/// Header carrying the authenticated user id (set by the auth layer in front)
pub const USER_ID_HEADER: &str = "x-user-id";

/// Limiter bound to one logical endpoint
#[derive(Clone, Debug)]
pub struct EndpointGuard {
    limiter: RateLimiter,
    endpoint: Arc<str>,
}

impl EndpointGuard {
    pub fn new(limiter: RateLimiter, endpoint: impl Into<Arc<str>>) -> Self {
        Self {
            limiter,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Authenticated user id, if any
pub fn user_id(headers: &HeaderMap) -> Option<String> {
    header_str(headers, USER_ID_HEADER).map(str::to_string)
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// Middleware function for `axum::middleware::from_fn_with_state`
pub async fn enforce(State(guard): State<EndpointGuard>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let user = user_id(headers);
    let ip = client_ip(headers, peer);

    let enforcement = match guard
        .limiter
        .enforce_rate_limit(guard.endpoint(), user.as_deref(), ip.as_deref(), false)
        .await
    {
        Ok(enforcement) => enforcement,
        Err(err) => {
            tracing::error!(endpoint = guard.endpoint(), error = %err, "Rate limit check failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Rate limiting is temporarily unavailable" })),
            )
                .into_response();
        }
    };

    if !enforcement.allowed {
        let retry_after = enforcement.headers.and_then(|h| h.retry_after);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": enforcement.error.unwrap_or_else(|| "Too many requests".to_string()),
                "retryAfter": retry_after,
            })),
        )
            .into_response();
        if let Some(headers) = enforcement.headers {
            headers.apply(response.headers_mut());
        }
        return response;
    }

    let mut response = next.run(request).await;
    if let Some(headers) = enforcement.headers {
        headers.apply(response.headers_mut());
    }
    response
}
