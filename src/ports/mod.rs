//! Ports: the traits `core` depends on. Adapters in `crate::adapters` implement them.
pub mod counter_store;
pub mod http_client;
pub mod policy_store;

pub use counter_store::{CounterHit, CounterStore, StoreError, StoreResult};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use policy_store::{BlockRecord, NewBlock, PolicyStore};
