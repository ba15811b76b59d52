use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Outbound HTTP client for backend services, built on Hyper with Rustls.
///
/// Plain HTTP and HTTPS backends are both supported. The timeout bounds the wait
/// for the response head; the body is streamed back to the gateway as it arrives.
/// No retries are performed.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::debug!("Created backend HTTP client");
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        limit: Duration,
    ) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            return Err(HttpClientError::InvalidRequest(format!(
                "outgoing URI has no host: {}",
                req.uri()
            )));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        let span = tracing::debug_span!(
            "backend_request",
            http.method = %method,
            http.url = %uri,
            http.status_code = tracing::field::Empty,
        );
        tracing::debug!(parent: &span, "Outgoing request headers: {:?}", parts.headers);

        let outcome = timeout(limit, self.client.request(Request::from_parts(parts, body)))
            .instrument(span.clone())
            .await;
        match outcome {
            Ok(Ok(response)) => {
                span.record("http.status_code", response.status().as_u16());
                let (mut parts, hyper_body) = response.into_parts();
                // Framing is re-applied by the server side
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Ok(Err(e)) if e.is_connect() => {
                tracing::debug!("Connection to {} failed: {}", uri, e);
                Err(HttpClientError::ConnectionError(error_chain(&e)))
            }
            Ok(Err(e)) => {
                tracing::debug!("Request {} {} failed: {}", method, uri, e);
                Err(HttpClientError::Transport(error_chain(&e)))
            }
            Err(_) => {
                tracing::debug!("Request {} {} timed out after {:?}", method, uri, limit);
                Err(HttpClientError::Timeout(limit))
            }
        }
    }
}

/// Hyper's top-level error text is generic; the useful part is in the sources.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();
        let err = client
            .send_request(req, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpClientError::ConnectionError(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri("/no-host")
            .body(AxumBody::empty())
            .unwrap();
        let err = client
            .send_request(req, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidRequest(_)));
    }
}
