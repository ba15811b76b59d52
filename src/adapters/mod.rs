pub mod http_client;
pub mod http_handler;
pub mod memory_counter_store;
pub mod memory_policy_store;
pub mod middleware;
pub mod postgres_policy_store;
pub mod redis_counter_store;

/// Re-export commonly used types from adapters
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use memory_counter_store::MemoryCounterStore;
pub use memory_policy_store::MemoryPolicyStore;
pub use middleware::*;
pub use postgres_policy_store::PgPolicyStore;
pub use redis_counter_store::RedisCounterStore;
