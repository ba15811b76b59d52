//! Forwarding of a routed request to its service backend.
use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, Uri, header},
    response::Response,
};

use crate::{
    core::{error::GatewayError, route_table::CompiledRoute},
    ports::http_client::{HttpClient, HttpClientError},
};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";
pub const SERVICE_TARGET_HEADER: &str = "x-service-target";

/// Connection-scoped headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

pub struct ProxyForwarder {
    http_client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl ProxyForwarder {
    pub fn new(http_client: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            http_client,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `req` to `route`'s backend, keeping the original path and query.
    pub async fn forward(
        &self,
        req: Request<Body>,
        route: &CompiledRoute,
        client_ip: IpAddr,
    ) -> Result<Response, GatewayError> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = route.backend.join(path_and_query);
        let uri: Uri = target.parse().map_err(|e| {
            GatewayError::InvalidRequest(format!("cannot build backend URI '{target}': {e}"))
        })?;

        let original_host = parts.headers.get(header::HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
        strip_hop_by_hop(&mut parts.headers);
        let headers = &mut parts.headers;
        if let Ok(host) = HeaderValue::from_str(route.backend.authority()) {
            headers.insert(header::HOST, host);
        }
        let forwarded_for = match headers.get(FORWARDED_FOR_HEADER).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {client_ip}"),
            None => client_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(HeaderName::from_static(FORWARDED_FOR_HEADER), value);
        }
        if let Some(host) = original_host {
            headers.insert(HeaderName::from_static(FORWARDED_HOST_HEADER), host);
        }
        if let Ok(service) = HeaderValue::from_str(&route.service) {
            headers.insert(HeaderName::from_static(SERVICE_TARGET_HEADER), service);
        }

        tracing::debug!(service = %route.service, target = %target, method = %parts.method, "Forwarding request");
        parts.uri = uri;
        let outgoing = Request::from_parts(parts, body);

        match self.http_client.send_request(outgoing, self.timeout).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Ok(Response::from_parts(parts, body))
            }
            Err(e) => {
                tracing::warn!(service = %route.service, target = %target, error = %e, "Backend request failed");
                Err(match e {
                    HttpClientError::ConnectionError(details) => GatewayError::BackendUnreachable {
                        service: route.service.clone(),
                        target,
                        details,
                    },
                    HttpClientError::Timeout(timeout) => GatewayError::BackendTimeout {
                        service: route.service.clone(),
                        timeout,
                    },
                    other => GatewayError::ProxyFailure {
                        service: route.service.clone(),
                        details: other.to_string(),
                    },
                })
            }
        }
    }
}

/// Remove the fixed hop-by-hop set plus any header named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::http::{Method, StatusCode};
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        config::models::{GlobalDefaults, RouteDefinition, ServiceConfig},
        core::route_table::RouteTable,
        ports::http_client::HttpClientResult,
    };

    /// Records the outgoing request and answers with a canned outcome.
    struct RecordingClient {
        seen: Mutex<Option<(Uri, HeaderMap)>>,
        fail_with: Mutex<Option<HttpClientError>>,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(
            &self,
            req: Request<Body>,
            _timeout: Duration,
        ) -> HttpClientResult<Response<Body>> {
            *self.seen.lock().await = Some((req.uri().clone(), req.headers().clone()));
            if let Some(err) = self.fail_with.lock().await.take() {
                return Err(err);
            }
            let mut response = Response::new(Body::from("ok"));
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            Ok(response)
        }
    }

    fn table() -> RouteTable {
        let services = vec![ServiceConfig {
            name: "users".to_string(),
            base_url: "http://localhost:3001".to_string(),
            rate_limit: None,
            routes: vec![RouteDefinition {
                path: "/api/users/*".to_string(),
                methods: vec!["GET".to_string()],
                ..Default::default()
            }],
        }];
        RouteTable::compile(&services, &GlobalDefaults::default()).unwrap()
    }

    fn client(fail_with: Option<HttpClientError>) -> Arc<RecordingClient> {
        Arc::new(RecordingClient {
            seen: Mutex::new(None),
            fail_with: Mutex::new(fail_with),
        })
    }

    #[tokio::test]
    async fn test_forward_rewrites_target_and_headers() {
        let table = table();
        let route = table.match_route(&Method::GET, "/api/users/7").unwrap().route;
        let recorder = client(None);
        let proxy = ProxyForwarder::new(recorder.clone(), Duration::from_secs(5));

        let req = Request::builder()
            .uri("/api/users/7?expand=true")
            .header(header::HOST, "gateway.example.com")
            .header(header::CONNECTION, "keep-alive, x-trace-hop")
            .header("x-trace-hop", "1")
            .header("x-custom", "kept")
            .body(Body::empty())
            .unwrap();
        let response = proxy
            .forward(req, route, "203.0.113.5".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONNECTION).is_none());

        let (uri, headers) = recorder.seen.lock().await.clone().unwrap();
        assert_eq!(uri, "http://localhost:3001/api/users/7?expand=true");
        assert_eq!(headers[header::HOST], "localhost:3001");
        assert_eq!(headers[FORWARDED_FOR_HEADER], "203.0.113.5");
        assert_eq!(headers[FORWARDED_HOST_HEADER], "gateway.example.com");
        assert_eq!(headers[SERVICE_TARGET_HEADER], "users");
        assert_eq!(headers["x-custom"], "kept");
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-trace-hop").is_none());
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let table = table();
        let route = table.match_route(&Method::GET, "/api/users/1").unwrap().route;
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let request = || Request::builder().uri("/api/users/1").body(Body::empty()).unwrap();

        let proxy = ProxyForwarder::new(
            client(Some(HttpClientError::ConnectionError("refused".to_string()))),
            Duration::from_secs(5),
        );
        let err = proxy.forward(request(), route, ip).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(
            matches!(&err, GatewayError::BackendUnreachable { target, .. } if target == "http://localhost:3001/api/users/1")
        );

        let proxy = ProxyForwarder::new(
            client(Some(HttpClientError::Timeout(Duration::from_secs(5)))),
            Duration::from_secs(5),
        );
        let err = proxy.forward(request(), route, ip).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);

        let proxy = ProxyForwarder::new(
            client(Some(HttpClientError::Transport("reset".to_string()))),
            Duration::from_secs(5),
        );
        let err = proxy.forward(request(), route, ip).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind(), "proxy_error");
    }
}
