//! Response cache for cache-eligible routes.
//!
//! Entries are keyed by `<prefix><METHOD>:<path?query>` and hold the content type
//! and body of a 2xx backend response. A hit is replayed as `200 OK` without
//! touching the rate limiter or the backend.
use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};

use crate::{
    config::models::{ServerConfig, parse_period},
    core::{error::GatewayError, route_table::CompiledRoute, store_guard::bounded},
    ports::counter_store::{CounterStore, StoreResult},
};

pub const CACHE_HEADER: &str = "x-cache";
pub const CACHE_KEY_HEADER: &str = "x-cache-key";
pub const CACHE_TTL_HEADER: &str = "x-cache-ttl";

#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    content_type: Option<String>,
    /// Base64 of the raw body bytes
    body: String,
}

/// Result of reading a backend body up to the cacheable size.
enum Buffered {
    Complete(Bytes),
    /// Over the limit: the bytes read so far chained with the unread rest
    Oversized(Body),
}

async fn buffer_body(mut body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buf.extend_from_slice(&data);
        if buf.len() > limit {
            let head = stream::iter([Ok::<_, axum::Error>(buf.freeze())]);
            return Ok(Buffered::Oversized(Body::from_stream(
                head.chain(body.into_data_stream()),
            )));
        }
    }
    Ok(Buffered::Complete(buf.freeze()))
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub key_prefix: String,
    pub methods: Vec<Method>,
    pub store_timeout: Duration,
    pub max_body_bytes: usize,
    /// Deadline for reading a cacheable body once the response head arrived
    pub read_timeout: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &ServerConfig) -> Result<Self, String> {
        let methods = config
            .cache
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("cache.methods: invalid method '{m}'"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            ttl: parse_period("cache.ttl", &config.cache.ttl)?,
            key_prefix: config.cache.key_prefix.clone(),
            methods,
            store_timeout: parse_period("stores.timeout", &config.stores.timeout)?,
            max_body_bytes: config.cache.max_body_bytes,
            read_timeout: parse_period("global.proxy_timeout", &config.global.proxy_timeout)?,
        })
    }
}

pub struct CacheGate {
    counters: Arc<dyn CounterStore>,
    settings: CacheSettings,
}

impl CacheGate {
    pub fn new(counters: Arc<dyn CounterStore>, settings: CacheSettings) -> Self {
        Self { counters, settings }
    }

    pub fn is_eligible(&self, route: &CompiledRoute, method: &Method) -> bool {
        route.cache && self.settings.methods.contains(method)
    }

    pub fn key_for(&self, method: &Method, uri: &Uri) -> String {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());
        format!("{}{}:{}", self.settings.key_prefix, method, path_and_query)
    }

    /// Replay a cached response, if one exists. Store failures count as a miss.
    pub async fn lookup(&self, method: &Method, uri: &Uri) -> Option<Response> {
        let key = self.key_for(method, uri);
        let raw = match bounded(self.settings.store_timeout, "get", self.counters.get(&key)).await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(cache_key = %key, "Cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Cache lookup failed, treating as miss");
                return None;
            }
        };

        let decoded = serde_json::from_str::<CachedResponse>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|entry| {
                STANDARD
                    .decode(entry.body.as_bytes())
                    .map(|body| (entry.content_type, body))
                    .map_err(|e| e.to_string())
            });
        let (content_type, body) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Discarding unreadable cache entry");
                return None;
            }
        };

        tracing::debug!(cache_key = %key, "Cache hit");
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = StatusCode::OK;
        if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        self.tag(response.headers_mut(), "HIT", &key);
        Some(response)
    }

    /// Post-proxy stage: cache a successful response and tag it as a miss.
    ///
    /// The body is buffered so it can be both stored and returned; the write
    /// itself runs in the background and only logs on failure. Bodies over
    /// `max_body_bytes` are relayed untouched, and a body that does not arrive
    /// within `read_timeout` fails as a backend timeout.
    pub async fn store(
        &self,
        key: String,
        service: &str,
        response: Response,
    ) -> Result<Response, GatewayError> {
        if !response.status().is_success() {
            return Ok(response);
        }

        let limit = self.settings.max_body_bytes;
        let declared = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > u64::try_from(limit).unwrap_or(u64::MAX)) {
            tracing::debug!(cache_key = %key, content_length = ?declared, "Response too large to cache");
            return Ok(response);
        }

        let (mut parts, body) = response.into_parts();
        let buffered = tokio::time::timeout(self.settings.read_timeout, buffer_body(body, limit))
            .await
            .map_err(|_| {
                tracing::warn!(cache_key = %key, service, "Backend stalled while sending the body");
                GatewayError::BackendTimeout {
                    service: service.to_string(),
                    timeout: self.settings.read_timeout,
                }
            })?
            .map_err(|e| GatewayError::ProxyFailure {
                service: service.to_string(),
                details: format!("failed to read response body: {e}"),
            })?;
        let bytes = match buffered {
            Buffered::Complete(bytes) => bytes,
            Buffered::Oversized(body) => {
                tracing::debug!(cache_key = %key, limit, "Response too large to cache");
                return Ok(Response::from_parts(parts, body));
            }
        };

        let entry = CachedResponse {
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: STANDARD.encode(&bytes),
        };
        match serde_json::to_string(&entry) {
            Ok(value) => {
                let counters = self.counters.clone();
                let ttl = self.settings.ttl;
                let timeout = self.settings.store_timeout;
                let cache_key = key.clone();
                tokio::spawn(async move {
                    match bounded(
                        timeout,
                        "set_with_expiry",
                        counters.set_with_expiry(&cache_key, &value, ttl),
                    )
                    .await
                    {
                        Ok(()) => tracing::debug!(cache_key = %cache_key, "Cached response"),
                        Err(e) => {
                            tracing::warn!(cache_key = %cache_key, error = %e, "Failed to cache response")
                        }
                    }
                });
            }
            Err(e) => tracing::warn!(cache_key = %key, error = %e, "Failed to serialize response for cache"),
        }

        self.tag(&mut parts.headers, "MISS", &key);
        Ok(Response::from_parts(parts, Body::from(bytes)))
    }

    /// Delete every entry whose key (without the prefix) matches `pattern`.
    pub async fn invalidate(&self, pattern: &str) -> StoreResult<u64> {
        let full_pattern = format!("{}{}", self.settings.key_prefix, pattern);
        let timeout = self.settings.store_timeout;
        let keys = bounded(timeout, "list_keys", self.counters.list_keys(&full_pattern)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = bounded(timeout, "delete", self.counters.delete(&keys)).await?;
        tracing::info!(pattern = %full_pattern, removed, "Invalidated cache entries");
        Ok(removed)
    }

    fn tag(&self, headers: &mut HeaderMap, state: &'static str, key: &str) {
        headers.insert(CACHE_HEADER, HeaderValue::from_static(state));
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert(CACHE_KEY_HEADER, value);
        }
        headers.insert(CACHE_TTL_HEADER, HeaderValue::from(self.settings.ttl.as_secs()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::MemoryCounterStore, ports::counter_store::test_support::UnavailableCounterStore,
    };

    fn settings() -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(300),
            key_prefix: "cache:".to_string(),
            methods: vec![Method::GET],
            store_timeout: Duration::from_millis(500),
            max_body_bytes: 1024,
            read_timeout: Duration::from_secs(5),
        }
    }

    fn gate() -> (CacheGate, Arc<MemoryCounterStore>) {
        let counters = Arc::new(MemoryCounterStore::new());
        (CacheGate::new(counters.clone(), settings()), counters)
    }

    fn chunked(chunks: &[&'static str]) -> Response {
        let frames: Vec<Result<Bytes, std::io::Error>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        Response::new(Body::from_stream(stream::iter(frames)))
    }

    fn json_response(status: StatusCode, body: &'static str) -> Response {
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    async fn wait_for_key(counters: &MemoryCounterStore, key: &str) {
        for _ in 0..50 {
            if counters.get(key).await.unwrap().is_some() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("cache entry {key} was never written");
    }

    #[test]
    fn test_key_includes_method_path_and_query() {
        let (gate, _) = gate();
        let uri: Uri = "/api/users?page=2".parse().unwrap();
        assert_eq!(gate.key_for(&Method::GET, &uri), "cache:GET:/api/users?page=2");
    }

    #[tokio::test]
    async fn test_store_then_hit() {
        let (gate, counters) = gate();
        let uri: Uri = "/api/users".parse().unwrap();
        assert!(gate.lookup(&Method::GET, &uri).await.is_none());

        let key = gate.key_for(&Method::GET, &uri);
        let stored = gate
            .store(key.clone(), "users", json_response(StatusCode::OK, r#"[{"id":1}]"#))
            .await
            .unwrap();
        assert_eq!(stored.headers()[CACHE_HEADER], "MISS");
        assert_eq!(stored.headers()[CACHE_KEY_HEADER], key.as_str());
        assert_eq!(
            stored.into_body().collect().await.unwrap().to_bytes(),
            r#"[{"id":1}]"#
        );

        wait_for_key(&counters, &key).await;
        let hit = gate.lookup(&Method::GET, &uri).await.unwrap();
        assert_eq!(hit.status(), StatusCode::OK);
        assert_eq!(hit.headers()[CACHE_HEADER], "HIT");
        assert_eq!(hit.headers()[CACHE_TTL_HEADER], "300");
        assert_eq!(hit.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(
            hit.into_body().collect().await.unwrap().to_bytes(),
            r#"[{"id":1}]"#
        );
    }

    #[tokio::test]
    async fn test_error_responses_are_not_cached() {
        let (gate, counters) = gate();
        let response = gate
            .store(
                "cache:GET:/missing".to_string(),
                "users",
                json_response(StatusCode::NOT_FOUND, "{}"),
            )
            .await
            .unwrap();
        assert!(response.headers().get(CACHE_HEADER).is_none());
        tokio::task::yield_now().await;
        assert!(counters.get("cache:GET:/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let (gate, counters) = gate();
        let ttl = Duration::from_secs(60);
        counters.set_with_expiry("cache:GET:/api/users", "x", ttl).await.unwrap();
        counters.set_with_expiry("cache:GET:/api/users/1", "x", ttl).await.unwrap();
        counters.set_with_expiry("cache:GET:/api/orders", "x", ttl).await.unwrap();

        assert_eq!(gate.invalidate("GET:/api/users*").await.unwrap(), 2);
        assert!(counters.get("cache:GET:/api/orders").await.unwrap().is_some());
        assert_eq!(gate.invalidate("GET:/api/users*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let (gate, counters) = gate();
        counters
            .set_with_expiry("cache:GET:/bad", "not json", Duration::from_secs(60))
            .await
            .unwrap();
        let uri: Uri = "/bad".parse().unwrap();
        assert!(gate.lookup(&Method::GET, &uri).await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_body_is_relayed_uncached() {
        let counters = Arc::new(MemoryCounterStore::new());
        let mut settings = settings();
        settings.max_body_bytes = 8;
        let gate = CacheGate::new(counters.clone(), settings);

        let response = gate
            .store("cache:GET:/big".to_string(), "users", chunked(&["hello ", "world", "!!"]))
            .await
            .unwrap();
        assert!(response.headers().get(CACHE_HEADER).is_none());
        assert_eq!(
            response.into_body().collect().await.unwrap().to_bytes(),
            "hello world!!"
        );

        let mut declared = json_response(StatusCode::OK, "0123456789");
        declared
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        let response = gate
            .store("cache:GET:/declared".to_string(), "users", declared)
            .await
            .unwrap();
        assert!(response.headers().get(CACHE_HEADER).is_none());

        tokio::task::yield_now().await;
        assert!(counters.list_keys("cache:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_body_is_a_backend_timeout() {
        tokio::time::pause();
        let (gate, _) = gate();
        let stalled = stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"["))])
            .chain(stream::pending());
        let response = Response::new(Body::from_stream(stalled));

        match gate
            .store("cache:GET:/stall".to_string(), "users", response)
            .await
        {
            Err(GatewayError::BackendTimeout { service, timeout }) => {
                assert_eq!(service, "users");
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("expected backend timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_outage_never_changes_the_response() {
        let gate = CacheGate::new(Arc::new(UnavailableCounterStore::failing()), settings());
        let uri: Uri = "/api/users".parse().unwrap();
        assert!(gate.lookup(&Method::GET, &uri).await.is_none());

        let response = gate
            .store(
                gate.key_for(&Method::GET, &uri),
                "users",
                json_response(StatusCode::OK, r#"{"ok":true}"#),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_HEADER], "MISS");
        assert_eq!(
            response.into_body().collect().await.unwrap().to_bytes(),
            r#"{"ok":true}"#
        );
    }

    #[tokio::test]
    async fn test_invalidate_is_bounded_by_store_timeout() {
        tokio::time::pause();
        let gate = CacheGate::new(Arc::new(UnavailableCounterStore::hanging()), settings());
        let err = gate.invalidate("*").await.unwrap_err();
        assert!(matches!(
            err,
            crate::ports::counter_store::StoreError::Timeout { operation: "list_keys", .. }
        ));
    }
}
