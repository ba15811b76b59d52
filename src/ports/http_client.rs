use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The backend refused the connection or could not be reached
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No response headers arrived within the bound
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Any other transport failure after the connection was established
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send `req` to its absolute URI, waiting at most `timeout` for the response head.
    /// The body is streamed back to the caller unbuffered.
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>>;
}
