pub mod auth;
pub mod backend;
pub mod blocking;
pub mod cache;
pub mod error;
pub mod gateway;
pub mod proxy;
pub mod rate_limiter;
pub mod route_table;
pub mod store_guard;

pub use error::GatewayError;
pub use gateway::GatewayService;
pub use route_table::RouteTable;
