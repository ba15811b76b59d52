use std::{fmt, str::FromStr};

use thiserror::Error;

/// Errors related to backend operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A validated backend base URL such as `http://users:3001` or `https://api.internal/v2`.
///
/// Stored without a trailing slash so that joining the client's path (which always
/// starts with `/`) never produces `//`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: String,
    authority: String,
    is_secure: bool,
}

impl BackendUrl {
    pub fn new(url: &str) -> BackendResult<Self> {
        let is_secure = url.starts_with("https://");
        if !is_secure && !url.starts_with("http://") {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BackendError::InvalidUrl(format!("{url}: missing host")))?;
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(BackendError::InvalidUrl(format!(
                "{url}: base URL must not carry a query or fragment"
            )));
        }

        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(BackendUrl {
            url: url.trim_end_matches('/').to_string(),
            authority,
            is_secure,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// `host[:port]`, used as the outgoing `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Append the client's original path and query to the base URL.
    pub fn join(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.url, path_and_query)
        } else {
            format!("{}/{}", self.url, path_and_query)
        }
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}
