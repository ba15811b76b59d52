use std::{future::Future, time::Duration};

use crate::ports::counter_store::{StoreError, StoreResult};

/// Run a store call with an upper bound so a slow store cannot stall a request.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}
