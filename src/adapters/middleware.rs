//! Axum middleware attached to the gateway router: request ids and the access log.
use std::{
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, Request},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Client address the gateway acted on, attached to the response extensions by
/// the handler. Differs from the socket peer behind a trusted proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Run the request inside a span carrying a request id, echoed as `X-Request-ID`.
///
/// A well-formed id supplied by the client (or an upstream proxy) is reused so
/// logs can be correlated across hops; otherwise a v4 UUID is generated.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }
    response
}

/// One access log line per request; the level follows the status class.
pub async fn access_log_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let response = next.run(req).await;
    let peer = logged_client_ip(&response, peer);
    let status = response.status();
    let latency_ms = start.elapsed().as_millis() as u64;

    let level = access_level(status);
    if level == tracing::Level::ERROR {
        tracing::error!(%method, %uri, client_ip = %peer, status = status.as_u16(), latency_ms, "request completed");
    } else if level == tracing::Level::WARN {
        tracing::warn!(%method, %uri, client_ip = %peer, status = status.as_u16(), latency_ms, "request completed");
    } else {
        tracing::info!(%method, %uri, client_ip = %peer, status = status.as_u16(), latency_ms, "request completed");
    }
    response
}

fn logged_client_ip(response: &Response, peer: Option<IpAddr>) -> String {
    response
        .extensions()
        .get::<ClientIp>()
        .map(|ClientIp(ip)| *ip)
        .or(peer)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn access_level(status: StatusCode) -> tracing::Level {
    if status.is_server_error() {
        tracing::Level::ERROR
    } else if status.is_client_error() {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    }
}
