//! Bearer token verification (HS256 JWT) for routes that require authentication.
//!
//! Every failed verification is reported to the blocking gate so that repeated
//! failures from one IP escalate into a block; a success clears that counter.
use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::http::{HeaderMap, header};
use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    config::models::{ServerConfig, parse_period},
    core::{blocking::BlockingGate, error::GatewayError},
};

/// Claim names checked, in order, for the caller's identity.
const SUBJECT_CLAIMS: [&str; 3] = ["userId", "id", "sub"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthFailure {
    #[error("Authorization token not provided")]
    MissingCredential,

    #[error("Authorization header must use the Bearer scheme")]
    WrongScheme,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token has expired")]
    TokenExpired,
}

impl AuthFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential | AuthFailure::WrongScheme => "missing_credentials",
            AuthFailure::InvalidToken(_) => "invalid_token",
            AuthFailure::TokenExpired => "token_expired",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential | AuthFailure::WrongScheme => "Unauthorized",
            AuthFailure::InvalidToken(_) => "Invalid Token",
            AuthFailure::TokenExpired => "Token Expired",
        }
    }
}

/// The verified caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub subject: Option<String>,
    pub claims: Map<String, Value>,
}

impl Principal {
    fn from_claims(claims: Map<String, Value>) -> Self {
        let subject = SUBJECT_CLAIMS
            .iter()
            .find_map(|name| match claims.get(*name) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            });
        Self { subject, claims }
    }
}

#[derive(Clone)]
pub struct AuthSettings {
    pub secret: String,
    pub issuer: Option<String>,
    pub token_ttl: Duration,
}

impl AuthSettings {
    pub fn from_config(config: &ServerConfig) -> Result<Self, String> {
        Ok(Self {
            secret: config.auth.jwt_secret.clone(),
            issuer: config.auth.issuer.clone(),
            token_ttl: parse_period("auth.token_ttl", &config.auth.token_ttl)?,
        })
    }
}

pub struct AuthGate {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
    settings: AuthSettings,
    blocking: Arc<BlockingGate>,
}

impl AuthGate {
    pub fn new(settings: AuthSettings, blocking: Arc<BlockingGate>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        if let Some(issuer) = &settings.issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(settings.secret.as_bytes()),
            validation,
            settings,
            blocking,
        }
    }

    /// Verify the request's bearer token, updating the failed-auth counter either way.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        ip: IpAddr,
    ) -> Result<Principal, GatewayError> {
        match self.verify(headers) {
            Ok(principal) => {
                self.blocking.clear_failed_auth(ip).await;
                tracing::debug!(client_ip = %ip, subject = ?principal.subject, "Authenticated");
                Ok(principal)
            }
            Err(failure) => {
                tracing::info!(client_ip = %ip, kind = failure.kind(), "Authentication failed: {}", failure);
                self.blocking.record_failed_auth(ip).await;
                Err(GatewayError::Unauthenticated(failure))
            }
        }
    }

    /// Pure token check without side effects.
    pub fn verify(&self, headers: &HeaderMap) -> Result<Principal, AuthFailure> {
        let token = bearer_token(headers)?;
        let data = decode::<Map<String, Value>>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::TokenExpired,
                _ => AuthFailure::InvalidToken(e.to_string()),
            })?;
        Ok(Principal::from_claims(data.claims))
    }

    /// Mint a token for `subject` valid for the configured TTL.
    pub fn issue_token(
        &self,
        subject: &str,
        extra_claims: Map<String, Value>,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.settings.token_ttl.as_secs()).unwrap_or(i64::MAX);

        let mut claims = extra_claims;
        claims.insert("userId".to_string(), Value::from(subject));
        claims.insert("sub".to_string(), Value::from(subject));
        claims.insert("iat".to_string(), Value::from(now));
        claims.insert("exp".to_string(), Value::from(now.saturating_add(ttl)));
        if let Some(issuer) = &self.settings.issuer {
            claims.insert("iss".to_string(), Value::from(issuer.as_str()));
        }

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthFailure> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthFailure::MissingCredential)?
        .to_str()
        .map_err(|_| AuthFailure::InvalidToken("non-ASCII authorization header".to_string()))?
        .trim();

    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthFailure::WrongScheme);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthFailure::MissingCredential);
    }
    Ok(token)
}
