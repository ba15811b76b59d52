//! Gateway error taxonomy and its JSON rendering.
//!
//! Every early exit of the pipeline is a [`GatewayError`]. Rendering is centralized
//! here so that all error bodies share the `{ error, kind, message }` shape.
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::{auth::AuthFailure, blocking::BlockNotice, rate_limiter::RateLimitStatus};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("client {} is blocked: {}", .0.ip, .0.reason)]
    ClientBlocked(Box<BlockNotice>),

    #[error("unauthenticated: {0}")]
    Unauthenticated(AuthFailure),

    #[error("rate limit of {} requests exceeded", .0.limit)]
    RateLimited(RateLimitStatus),

    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("service '{service}' is unreachable at {target}: {details}")]
    BackendUnreachable {
        service: String,
        target: String,
        details: String,
    },

    #[error("service '{service}' did not respond within {timeout:?}")]
    BackendTimeout { service: String, timeout: Duration },

    #[error("proxying to service '{service}' failed: {details}")]
    ProxyFailure { service: String, details: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

impl GatewayError {
    pub fn internal(message: impl Into<String>, details: impl ToString) -> Self {
        GatewayError::Internal {
            message: message.into(),
            details: Some(details.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ClientBlocked(_) => StatusCode::FORBIDDEN,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ProxyFailure { .. } | GatewayError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error kind carried in every body.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ClientBlocked(_) => "client_blocked",
            GatewayError::Unauthenticated(failure) => failure.kind(),
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::BackendUnreachable { .. } => "backend_unreachable",
            GatewayError::BackendTimeout { .. } => "backend_timeout",
            GatewayError::ProxyFailure { .. } => "proxy_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    fn body(&self, development_mode: bool) -> Value {
        let kind = self.kind();
        match self {
            GatewayError::ClientBlocked(notice) => json!({
                "error": "Forbidden",
                "kind": kind,
                "message": notice.message,
                "reason": notice.reason,
                "blocked_at": notice.blocked_at.map(|t| t.to_rfc3339()),
                "blocked_until": notice.blocked_until.map(|t| t.to_rfc3339()),
                "time_left_seconds": match notice.seconds_left {
                    Some(secs) => json!(secs),
                    None => json!("permanent"),
                },
                "is_permanent": notice.is_permanent,
            }),
            GatewayError::Unauthenticated(failure) => json!({
                "error": failure.title(),
                "kind": kind,
                "message": failure.to_string(),
            }),
            GatewayError::RateLimited(status) => json!({
                "error": "Too Many Requests",
                "kind": kind,
                "message": format!(
                    "Rate limit exceeded. Try again in {} seconds.",
                    status.retry_after_secs
                ),
                "limit": status.limit,
                "window_seconds": status.window.as_secs(),
                "remaining_time": status.retry_after_secs,
            }),
            GatewayError::RouteNotFound { method, path } => json!({
                "error": "Not Found",
                "kind": kind,
                "message": format!("No route configured for {method} {path}"),
            }),
            GatewayError::BackendUnreachable {
                service,
                target,
                details,
            } => json!({
                "error": "Bad Gateway",
                "kind": kind,
                "message": format!("Service {service} is not responding"),
                "service": service,
                "details": format!("Could not connect to {target}: {details}"),
            }),
            GatewayError::BackendTimeout { service, timeout } => json!({
                "error": "Gateway Timeout",
                "kind": kind,
                "message": format!(
                    "Service {service} did not respond within {}",
                    humantime::format_duration(*timeout)
                ),
                "service": service,
            }),
            GatewayError::ProxyFailure { service, details } => json!({
                "error": "Proxy Error",
                "kind": kind,
                "message": format!("Failed to forward request to service {service}"),
                "service": service,
                "details": details,
            }),
            GatewayError::InvalidRequest(message) => json!({
                "error": "Bad Request",
                "kind": kind,
                "message": message,
            }),
            GatewayError::Internal { message, details } => {
                let mut body = json!({
                    "error": "Internal Server Error",
                    "kind": kind,
                    "message": message,
                });
                // Store and driver messages stay out of production responses
                if let Some(details) = details.as_ref().filter(|_| development_mode) {
                    body["details"] = json!(details);
                }
                body
            }
        }
    }

    /// Render as a JSON response. With `development_mode` the body also carries the
    /// full debug representation of the error.
    pub fn to_response(&self, development_mode: bool) -> Response {
        let mut body = self.body(development_mode);
        if development_mode {
            body["debug"] = json!(format!("{self:?}"));
        }

        let mut response = (self.status(), Json(body)).into_response();
        let headers = response.headers_mut();
        match self {
            GatewayError::Unauthenticated(_) => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            GatewayError::RateLimited(status) => {
                status.apply_headers(headers);
                headers.insert(header::RETRY_AFTER, HeaderValue::from(status.retry_after_secs));
            }
            _ => {}
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(false)
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_route_not_found_body() {
        let err = GatewayError::RouteNotFound {
            method: "GET".to_string(),
            path: "/nope".to_string(),
        };
        let response = err.to_response(false);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );

        let body = json_body(response).await;
        assert_eq!(body["kind"], "route_not_found");
        assert_eq!(body["error"], "Not Found");
        assert!(body.get("debug").is_none());
    }

    #[tokio::test]
    async fn test_bad_gateway_names_service_and_target() {
        let err = GatewayError::BackendUnreachable {
            service: "users".to_string(),
            target: "http://localhost:3001/users/1".to_string(),
            details: "connection refused".to_string(),
        };
        let body = json_body(err.to_response(false)).await;
        assert_eq!(body["error"], "Bad Gateway");
        assert_eq!(body["service"], "users");
        assert!(
            body["details"]
                .as_str()
                .unwrap()
                .contains("http://localhost:3001/users/1")
        );
    }

    #[tokio::test]
    async fn test_development_mode_adds_debug() {
        let err = GatewayError::internal("store unavailable", "redis: connection reset");
        let response = err.to_response(true);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["details"], "redis: connection reset");
        assert!(body["debug"].as_str().unwrap().contains("Internal"));
    }

    #[tokio::test]
    async fn test_internal_details_hidden_outside_development_mode() {
        let err = GatewayError::internal("store unavailable", "redis: connection reset");
        let body = json_body(err.to_response(false)).await;
        assert_eq!(body["kind"], "internal_error");
        assert_eq!(body["message"], "store unavailable");
        assert!(body.get("details").is_none());
        assert!(body.get("debug").is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_sets_challenge() {
        let response = GatewayError::Unauthenticated(AuthFailure::TokenExpired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        let body = json_body(response).await;
        assert_eq!(body["kind"], "token_expired");
        assert_eq!(body["error"], "Token Expired");
    }
}
