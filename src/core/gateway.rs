//! Core gateway orchestration service.
//!
//! `GatewayService` owns the compiled route table and every gate, all built once
//! from the immutable `ServerConfig`. It runs the routed part of the pipeline:
//!
//! Router → Auth (if the route requires it) → Cache lookup (eligible routes) →
//! Rate limiter (if the route requires it) → Proxy → Cache store → rate headers
//!
//! The first gate that rejects ends the pipeline with a rendered [`GatewayError`].
//! The IP blocking check, gateway-internal endpoints and the 429 escalation
//! observer live one layer up, in the HTTP handler adapter.
use std::{net::IpAddr, sync::Arc};

use axum::{body::Body, http::HeaderMap, http::Request, response::Response};
use eyre::{Result, WrapErr, eyre};

use crate::{
    config::{ServerConfig, models::parse_period},
    core::{
        auth::{AuthGate, AuthSettings, Principal},
        blocking::{BlockingGate, BlockingSettings},
        cache::{CacheGate, CacheSettings},
        error::GatewayError,
        proxy::ProxyForwarder,
        rate_limiter::{FixedWindowRateLimiter, RateLimitSettings, RateLimitStatus},
        route_table::RouteTable,
    },
    ports::{counter_store::CounterStore, http_client::HttpClient, policy_store::PolicyStore},
};

/// Process-wide gateway state, shared behind an `Arc` by every connection.
pub struct GatewayService {
    config: Arc<ServerConfig>,
    routes: RouteTable,
    blocking: Arc<BlockingGate>,
    auth: AuthGate,
    cache: CacheGate,
    rate_limiter: FixedWindowRateLimiter,
    proxy: ProxyForwarder,
    policies: Arc<dyn PolicyStore>,
}

impl GatewayService {
    /// Assemble the gateway from configuration and its store/client ports.
    ///
    /// Fails if a route does not compile or a duration is malformed; a gateway is
    /// never started with a partially valid route table.
    pub fn new(
        config: Arc<ServerConfig>,
        counters: Arc<dyn CounterStore>,
        policies: Arc<dyn PolicyStore>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        let routes = RouteTable::compile(&config.services, &config.global)
            .wrap_err("Failed to compile route table")?;

        let blocking_settings = BlockingSettings::from_config(&config).map_err(|e| eyre!(e))?;
        let auth_settings = AuthSettings::from_config(&config).map_err(|e| eyre!(e))?;
        let cache_settings = CacheSettings::from_config(&config).map_err(|e| eyre!(e))?;
        let rate_settings = RateLimitSettings::from_config(&config).map_err(|e| eyre!(e))?;
        let proxy_timeout =
            parse_period("global.proxy_timeout", &config.global.proxy_timeout).map_err(|e| eyre!(e))?;

        let blocking = Arc::new(BlockingGate::new(
            counters.clone(),
            policies.clone(),
            blocking_settings,
        ));
        let auth = AuthGate::new(auth_settings, blocking.clone());
        let cache = CacheGate::new(counters.clone(), cache_settings);
        let rate_limiter = FixedWindowRateLimiter::new(counters, rate_settings);
        let proxy = ProxyForwarder::new(http_client, proxy_timeout);

        tracing::info!(
            services = config.services.len(),
            routes = routes.len(),
            "Gateway assembled"
        );

        Ok(Self {
            config,
            routes,
            blocking,
            auth,
            cache,
            rate_limiter,
            proxy,
            policies,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn blocking(&self) -> &BlockingGate {
        &self.blocking
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn cache(&self) -> &CacheGate {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &FixedWindowRateLimiter {
        &self.rate_limiter
    }

    /// Render an error the way this gateway is configured to.
    pub fn render(&self, err: &GatewayError) -> Response {
        err.to_response(self.config.development_mode)
    }

    /// Run the routed pipeline for a request that passed the blocking gate.
    pub async fn handle_routed(&self, req: Request<Body>, client_ip: IpAddr) -> Response {
        match self.route_request(req, client_ip).await {
            Ok(response) => response,
            Err(err) => self.render(&err),
        }
    }

    async fn route_request(
        &self,
        mut req: Request<Body>,
        client_ip: IpAddr,
    ) -> Result<Response, GatewayError> {
        let method = req.method().clone();
        let matched = self
            .routes
            .match_route(&method, req.uri().path())
            .ok_or_else(|| GatewayError::RouteNotFound {
                method: method.to_string(),
                path: req.uri().path().to_string(),
            })?;
        let route = matched.route;
        tracing::debug!(
            service = %route.service,
            template = %route.template,
            params = ?matched.params,
            "Matched route"
        );

        if route.requires_auth {
            let principal = self.auth.authenticate(req.headers(), client_ip).await?;
            req.extensions_mut().insert(principal);
        }

        let cache_key = if self.cache.is_eligible(route, &method) {
            if let Some(hit) = self.cache.lookup(&method, req.uri()).await {
                return Ok(hit);
            }
            Some(self.cache.key_for(&method, req.uri()))
        } else {
            None
        };

        let rate_status = if route.rate_limit {
            self.rate_limiter.check(client_ip).await?
        } else {
            None
        };

        let mut response = self.proxy.forward(req, route, client_ip).await?;

        if let Some(key) = cache_key {
            response = self.cache.store(key, &route.service, response).await?;
        }
        if let Some(status) = rate_status {
            status.apply_headers(response.headers_mut());
        }
        Ok(response)
    }

    /// Gates applied to admin endpoints: auth when configured, then the rate
    /// limiter regardless of any route flag.
    pub async fn admit_admin(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
    ) -> Result<(Option<Principal>, Option<RateLimitStatus>), GatewayError> {
        let principal = if self.config.admin.require_auth {
            Some(self.auth.authenticate(headers, client_ip).await?)
        } else {
            None
        };
        let rate_status = self.rate_limiter.check(client_ip).await?;
        Ok((principal, rate_status))
    }

    /// Release store connections.
    pub async fn close(&self) {
        self.policies.close().await;
    }
}
