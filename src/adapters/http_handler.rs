use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::{Body as AxumBody, to_bytes},
    extract::{ConnectInfo, Request},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::middleware::{ClientIp, access_log_middleware, request_id_middleware},
    core::{GatewayService, error::GatewayError},
    ports::policy_store::NewBlock,
};

/// Largest admin request body accepted.
const ADMIN_BODY_LIMIT: usize = 64 * 1024;
const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct BlockIpRequest {
    ip: String,
    reason: String,
    #[serde(default, alias = "durationMinutes")]
    duration_minutes: Option<u64>,
    #[serde(default)]
    permanent: bool,
}

/// HTTP entry point of the gateway.
///
/// Applies the IP blocking gate to every request, serves the gateway's own
/// endpoints (`/`, `/health`, `/services`, `/admin/*`) and hands everything else to
/// the routed pipeline. Any 429 leaving this handler counts as a rate-limit
/// violation for the client.
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &GatewayService {
        &self.gateway
    }

    /// Main request handler.
    pub async fn handle_request(&self, req: Request) -> Response {
        let client_ip = self.client_ip(&req);

        let mut response = match self.gateway.blocking().check(client_ip).await {
            Err(err) => self.gateway.render(&err),
            Ok(()) => {
                let response = self.dispatch(req, client_ip).await;
                if response.status() == StatusCode::TOO_MANY_REQUESTS {
                    self.gateway.blocking().record_rate_exceeded(client_ip).await;
                }
                response
            }
        };
        response.extensions_mut().insert(ClientIp(client_ip));
        response
    }

    async fn dispatch(&self, req: Request, client_ip: IpAddr) -> Response {
        let is_get = req.method() == Method::GET;
        let path = req.uri().path().to_string();

        match path.as_str() {
            "/" if is_get => self.handle_root(),
            "/health" if is_get => self.handle_health(),
            "/services" if is_get => self.handle_services(),
            _ if self.gateway.config().admin.enabled
                && (path == "/admin" || path.starts_with("/admin/")) =>
            {
                self.handle_admin(req, client_ip).await
            }
            _ => self.gateway.handle_routed(req, client_ip).await,
        }
    }

    /// The socket peer, unless forwarded headers are trusted and present.
    pub fn client_ip(&self, req: &Request) -> IpAddr {
        if self.gateway.config().trust_forwarded_headers {
            if let Some(ip) = forwarded_ip(req.headers()) {
                return ip;
            }
        }
        match req.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => addr.ip().to_canonical(),
            None => {
                tracing::warn!("No peer address on request, using 0.0.0.0");
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
        }
    }

    fn handle_root(&self) -> Response {
        Json(json!({
            "message": "Tollgate API gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "documentation": {
                "health": "/health",
                "services": "/services",
            },
        }))
        .into_response()
    }

    fn handle_health(&self) -> Response {
        let mut features = vec!["ip_blocking", "jwt_auth", "response_cache", "rate_limiting"];
        if self.gateway.config().admin.enabled {
            features.push("admin_api");
        }
        Json(json!({
            "status": "UP",
            "message": "API gateway is running",
            "timestamp": Utc::now().to_rfc3339(),
            "features": features,
        }))
        .into_response()
    }

    fn handle_services(&self) -> Response {
        let services = self.gateway.routes().summary();
        Json(json!({
            "total": services.len(),
            "services": services,
        }))
        .into_response()
    }

    async fn handle_admin(&self, req: Request, client_ip: IpAddr) -> Response {
        let (principal, rate_status) =
            match self.gateway.admit_admin(req.headers(), client_ip).await {
                Ok(admitted) => admitted,
                Err(err) => return self.gateway.render(&err),
            };
        let actor = principal
            .and_then(|p| p.subject)
            .unwrap_or_else(|| "admin".to_string());

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/admin/blocked-ips") => self.list_blocks(&query).await,
            (&Method::POST, "/admin/block-ip") => self.block_ip(req.into_body(), &actor).await,
            (&Method::DELETE, "/admin/cache") => self.invalidate_cache(&query).await,
            (&Method::DELETE, p) if p.starts_with("/admin/unblock-ip/") => {
                self.unblock_ip(&p["/admin/unblock-ip/".len()..]).await
            }
            _ => Err(GatewayError::RouteNotFound {
                method: method.to_string(),
                path: path.clone(),
            }),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(err) => self.gateway.render(&err),
        };
        if let Some(status) = rate_status {
            status.apply_headers(response.headers_mut());
        }
        response
    }

    async fn list_blocks(&self, query: &str) -> Result<Response, GatewayError> {
        let limit = match query_param(query, "limit") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    GatewayError::InvalidRequest(format!("limit must be a positive integer, got '{raw}'"))
                })?,
            None => DEFAULT_LIST_LIMIT,
        };
        let blocks = self
            .gateway
            .blocking()
            .list(limit)
            .await
            .map_err(|e| GatewayError::internal("Failed to list blocked IPs", e))?;
        Ok(Json(json!({ "total": blocks.len(), "blocked_ips": blocks })).into_response())
    }

    async fn block_ip(&self, body: AxumBody, actor: &str) -> Result<Response, GatewayError> {
        let bytes = to_bytes(body, ADMIN_BODY_LIMIT)
            .await
            .map_err(|e| GatewayError::InvalidRequest(format!("unreadable body: {e}")))?;
        let request: BlockIpRequest = serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid JSON body: {e}")))?;

        let ip = request
            .ip
            .trim()
            .parse::<IpAddr>()
            .map(|ip| ip.to_canonical())
            .map_err(|_| GatewayError::InvalidRequest(format!("'{}' is not an IP address", request.ip)))?;
        if request.reason.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("reason is required".to_string()));
        }

        let blocked_until = match (request.permanent, request.duration_minutes) {
            (true, _) => None,
            (false, Some(minutes)) if minutes > 0 => {
                let minutes = i64::try_from(minutes).unwrap_or(i64::MAX / 60_000);
                let until = chrono::Duration::try_minutes(minutes)
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .ok_or_else(|| {
                        GatewayError::InvalidRequest("duration_minutes is too large".to_string())
                    })?;
                Some(until)
            }
            (false, _) => {
                return Err(GatewayError::InvalidRequest(
                    "duration_minutes must be positive unless the block is permanent".to_string(),
                ));
            }
        };

        let record = self
            .gateway
            .blocking()
            .block(NewBlock {
                ip: ip.to_string(),
                reason: request.reason.trim().to_string(),
                blocked_until,
                is_permanent: request.permanent,
                created_by: actor.to_string(),
            })
            .await
            .map_err(|e| GatewayError::internal("Failed to block IP", e))?;

        Ok(Json(json!({
            "message": format!("IP {} blocked", record.ip),
            "block": record,
        }))
        .into_response())
    }

    async fn unblock_ip(&self, raw: &str) -> Result<Response, GatewayError> {
        if raw.is_empty() {
            return Err(GatewayError::InvalidRequest("IP address is required".to_string()));
        }
        // Blocks are keyed by the canonical form written by block_ip and the gate
        let ip = raw
            .parse::<IpAddr>()
            .map(|ip| ip.to_canonical().to_string())
            .map_err(|_| GatewayError::InvalidRequest(format!("'{raw}' is not an IP address")))?;
        let removed = self
            .gateway
            .blocking()
            .unblock(&ip)
            .await
            .map_err(|e| GatewayError::internal("Failed to unblock IP", e))?;

        let (status, message) = if removed {
            (StatusCode::OK, format!("IP {ip} unblocked"))
        } else {
            (StatusCode::NOT_FOUND, format!("IP {ip} was not blocked"))
        };
        Ok((status, Json(json!({ "message": message, "removed": removed }))).into_response())
    }

    async fn invalidate_cache(&self, query: &str) -> Result<Response, GatewayError> {
        let pattern = query_param(query, "pattern").unwrap_or_else(|| "*".to_string());
        let removed = self
            .gateway
            .cache()
            .invalidate(&pattern)
            .await
            .map_err(|e| GatewayError::internal("Failed to invalidate cache", e))?;
        Ok(Json(json!({ "pattern": pattern, "removed": removed })).into_response())
    }
}

/// Build the axum router serving every path through `handler`.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    Router::new()
        .fallback(move |req: Request| {
            let handler = handler.clone();
            async move { handler.handle_request(req).await }
        })
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(access_log_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

/// First `X-Forwarded-For` entry, else `X-Real-IP`.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    from_xff
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        })
        .map(|ip| ip.to_canonical())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_ip_prefers_first_xff_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.1".parse().unwrap());
        assert_eq!(forwarded_ip(&headers), Some("203.0.113.9".parse().unwrap()));

        headers.remove("x-forwarded-for");
        assert_eq!(forwarded_ip(&headers), Some("198.51.100.1".parse().unwrap()));

        headers.insert("x-real-ip", "not-an-ip".parse().unwrap());
        assert_eq!(forwarded_ip(&headers), None);
    }

    #[test]
    fn test_forwarded_ip_unmaps_ipv4_in_ipv6() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "::ffff:192.0.2.4".parse().unwrap());
        assert_eq!(forwarded_ip(&headers), Some("192.0.2.4".parse().unwrap()));
    }

    #[test]
    fn test_query_param_decodes() {
        assert_eq!(
            query_param("pattern=GET%3A%2Fapi%2A&x=1", "pattern").as_deref(),
            Some("GET:/api*")
        );
        assert_eq!(query_param("", "pattern"), None);
    }
}
