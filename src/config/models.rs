//! Configuration data structures for Tollgate.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde-friendly and carry defaults so that a minimal config only lists services.
//! Durations are humantime strings (`"5s"`, `"15m"`, `"24h"`) and are parsed once
//! when the gateway is assembled, never on the request path.
//!
//! camelCase aliases (`baseUrl`, `requiresAuth`, `rateLimit`, `defaultRateLimit`) are
//! accepted so that service catalogues written for older gateways load unchanged. The
//! lowercased forms are listed too since `config` may fold key case.
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_proxy_timeout() -> String {
    "5s".to_string()
}

fn default_rate_window() -> String {
    "15m".to_string()
}

fn default_max_requests() -> u64 {
    100
}

fn default_rate_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_cache_ttl() -> String {
    "300s".to_string()
}

fn default_cache_key_prefix() -> String {
    "cache:".to_string()
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_cache_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_failed_auth() -> u64 {
    5
}

fn default_failed_auth_window() -> String {
    "5m".to_string()
}

fn default_failed_auth_block() -> String {
    "60m".to_string()
}

fn default_max_rate_exceeded() -> u64 {
    10
}

fn default_rate_exceed_window() -> String {
    "1h".to_string()
}

fn default_rate_exceed_block() -> String {
    "24h".to_string()
}

fn default_token_ttl() -> String {
    "24h".to_string()
}

fn default_store_timeout() -> String {
    "500ms".to_string()
}

fn default_max_db_connections() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root configuration document.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the gateway listens on, e.g. `0.0.0.0:3000`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Include the full error chain in JSON error bodies
    #[serde(default)]
    pub development_mode: bool,

    /// Derive the client IP from `X-Forwarded-For` / `X-Real-IP` instead of the socket peer
    #[serde(default)]
    pub trust_forwarded_headers: bool,

    #[serde(default)]
    pub global: GlobalDefaults,

    /// Backend services in declaration order; route matching follows this order
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub stores: StoreConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GlobalDefaults {
    /// Rate limiting for routes that do not say otherwise
    #[serde(default = "default_true", alias = "defaultRateLimit", alias = "defaultratelimit")]
    pub default_rate_limit: bool,

    /// Upper bound on a single backend call
    #[serde(default = "default_proxy_timeout", alias = "proxyTimeout", alias = "proxytimeout")]
    pub proxy_timeout: String,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            default_rate_limit: true,
            proxy_timeout: default_proxy_timeout(),
        }
    }
}

/// A named backend and the routes it serves.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(alias = "baseUrl", alias = "baseurl")]
    pub base_url: String,

    /// Service-level rate limit default, between the route flag and the global default
    #[serde(default, alias = "rateLimit", alias = "ratelimit")]
    pub rate_limit: Option<bool>,

    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

/// One route template of a service with its per-route policy flags.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RouteDefinition {
    /// Template such as `/users/:id` or `/files/*`
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default, alias = "requiresAuth", alias = "requiresauth")]
    pub requires_auth: Option<bool>,

    #[serde(default)]
    pub cache: Option<bool>,

    #[serde(default, alias = "rateLimit", alias = "ratelimit")]
    pub rate_limit: Option<bool>,
}

/// Fixed-window limit applied per client IP.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window")]
    pub window: String,

    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_rate_key_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: default_rate_window(),
            max_requests: default_max_requests(),
            key_prefix: default_rate_key_prefix(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl: String,

    #[serde(default = "default_cache_key_prefix")]
    pub key_prefix: String,

    /// Methods whose 2xx responses may be cached on cache-enabled routes
    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,

    /// Larger responses are relayed without being cached
    #[serde(default = "default_cache_max_body_bytes", alias = "maxBodyBytes")]
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            key_prefix: default_cache_key_prefix(),
            methods: default_cache_methods(),
            max_body_bytes: default_cache_max_body_bytes(),
        }
    }
}

/// Thresholds and windows turning repeated violations into standing blocks.
///
/// `max_failed_auth` and `failed_auth_block` can be overridden at runtime through the
/// policy store keys `max_login_attempts` and `block_duration_minutes`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EscalationConfig {
    #[serde(default = "default_max_failed_auth")]
    pub max_failed_auth: u64,

    #[serde(default = "default_failed_auth_window")]
    pub failed_auth_window: String,

    #[serde(default = "default_failed_auth_block")]
    pub failed_auth_block: String,

    #[serde(default = "default_max_rate_exceeded")]
    pub max_rate_exceeded: u64,

    #[serde(default = "default_rate_exceed_window")]
    pub rate_exceed_window: String,

    #[serde(default = "default_rate_exceed_block")]
    pub rate_exceed_block: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_failed_auth: default_max_failed_auth(),
            failed_auth_window: default_failed_auth_window(),
            failed_auth_block: default_failed_auth_block(),
            max_rate_exceeded: default_max_rate_exceeded(),
            rate_exceed_window: default_rate_exceed_window(),
            rate_exceed_block: default_rate_exceed_block(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    /// HS256 signing secret; usually supplied as `TOLLGATE__AUTH__JWT_SECRET`
    #[serde(default)]
    pub jwt_secret: String,

    /// Lifetime of tokens minted by `tollgate token`
    #[serde(default = "default_token_ttl")]
    pub token_ttl: String,

    /// Expected `iss` claim, if any
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl: default_token_ttl(),
            issuer: None,
        }
    }
}

/// Connection settings for the shared stores. Without URLs the gateway falls
/// back to in-process stores, which are only correct for a single instance.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_db_connections")]
    pub max_db_connections: u32,

    /// Bound on every store call made while handling a request
    #[serde(default = "default_store_timeout")]
    pub timeout: String,

    #[serde(default)]
    pub fail_closed: FailClosedConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            database_url: None,
            max_db_connections: default_max_db_connections(),
            timeout: default_store_timeout(),
            fail_closed: FailClosedConfig::default(),
        }
    }
}

/// Gates that reject requests, rather than allow them, when their store is down.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct FailClosedConfig {
    #[serde(default)]
    pub block_lookup: bool,

    #[serde(default)]
    pub rate_limit: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub require_auth: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_auth: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_true")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: true,
        }
    }
}

/// Parse a humantime period, naming the offending field on failure.
pub fn parse_period(field: &str, value: &str) -> Result<Duration, String> {
    let period = humantime::parse_duration(value)
        .map_err(|e| format!("Invalid duration for '{field}': '{value}' ({e})"))?;
    if period.is_zero() {
        return Err(format!("Duration for '{field}' must be greater than zero"));
    }
    Ok(period)
}

impl ServerConfig {
    /// True if any route, or the admin surface, needs bearer token verification.
    pub fn needs_jwt_secret(&self) -> bool {
        let admin_needs = self.admin.enabled && self.admin.require_auth;
        admin_needs
            || self
                .services
                .iter()
                .flat_map(|s| s.routes.iter())
                .any(|r| r.requires_auth.unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "services": [
                    { "name": "users", "baseUrl": "http://localhost:3001",
                      "routes": [ { "path": "/users/:id", "methods": ["GET"] } ] }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:3000");
        assert!(config.global.default_rate_limit);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window, "15m");
        assert_eq!(config.cache.key_prefix, "cache:");
        assert_eq!(config.escalation.max_failed_auth, 5);
        assert_eq!(config.escalation.max_rate_exceeded, 10);
        assert_eq!(config.services[0].base_url, "http://localhost:3001");
        assert_eq!(config.services[0].routes[0].requires_auth, None);
        assert!(!config.stores.fail_closed.block_lookup);
    }

    #[test]
    fn test_camel_case_route_flags() {
        let route: RouteDefinition = serde_json::from_str(
            r#"{ "path": "/public", "methods": ["GET"], "requiresAuth": false, "rateLimit": false, "cache": true }"#,
        )
        .unwrap();
        assert_eq!(route.requires_auth, Some(false));
        assert_eq!(route.rate_limit, Some(false));
        assert_eq!(route.cache, Some(true));
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(
            parse_period("rate_limit.window", "15m").unwrap(),
            Duration::from_secs(900)
        );
        assert!(parse_period("cache.ttl", "soon").is_err());
        assert!(parse_period("cache.ttl", "0s").is_err());
    }

    #[test]
    fn test_needs_jwt_secret() {
        let mut config: ServerConfig = serde_json::from_str(
            r#"{ "admin": { "enabled": false },
                 "services": [ { "name": "open", "base_url": "http://localhost:1",
                   "routes": [ { "path": "/", "methods": ["GET"], "requires_auth": false } ] } ] }"#,
        )
        .unwrap();
        assert!(!config.needs_jwt_secret());

        config.services[0].routes[0].requires_auth = None;
        assert!(config.needs_jwt_secret());
    }
}
