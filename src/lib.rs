//! Tollgate - an API gateway enforcing IP blocking, bearer-token authentication,
//! response caching and fixed-window rate limiting in front of backend services.
//!
//! Tollgate follows a **hexagonal architecture**: the request pipeline lives in
//! [`core`], the stores and the outbound HTTP client it depends on are traits in
//! [`ports`], and [`adapters`] provides the implementations (Redis / Postgres /
//! in-memory stores, a Hyper client and the axum entry point).
//!
//! # Pipeline
//! Every request passes, in order and with early exit:
//! 1. the blocking gate (standing blocks and escalation counters)
//! 2. gateway-internal endpoints (`/`, `/health`, `/services`, `/admin/*`)
//! 3. the router (first matching route in declaration order, else 404)
//! 4. authentication for routes with `requires_auth`
//! 5. the response cache for cache-enabled routes
//! 6. the fixed-window rate limiter for routes with `rate_limit`
//! 7. the proxy to the route's service, then the cache store step
//!
//! A 429 leaving the gateway counts against the client's rate-exceed counter;
//! enough of them turn into a temporary block.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use tollgate::{
//!     GatewayService, HttpClientAdapter, HttpHandler,
//!     adapters::{MemoryCounterStore, MemoryPolicyStore, http_handler},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = tollgate::config::loader::load_config("gateway.yaml").await?;
//! let gateway = Arc::new(GatewayService::new(
//!     Arc::new(config),
//!     Arc::new(MemoryCounterStore::new()),
//!     Arc::new(MemoryPolicyStore::new()),
//!     Arc::new(HttpClientAdapter::new()?),
//! )?);
//! let app = http_handler::router(Arc::new(HttpHandler::new(gateway)));
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Shared state
//! All cross-request state (rate windows, escalation counters, cached responses,
//! blocks) lives in the counter and policy stores, so several gateway instances
//! pointing at the same Redis and Postgres behave as one. The in-memory adapters
//! use `scc::HashMap` and are meant for single-instance deployments and tests.
//!
//! # Error Handling
//! Request-path failures are [`core::GatewayError`] values rendered as JSON bodies.
//! Startup and CLI code returns `eyre::Result<T>` with `WrapErr` context attached.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    core::{GatewayError, GatewayService},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
