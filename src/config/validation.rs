use std::{collections::HashSet, net::SocketAddr, str::FromStr};

use http::Method;
use regex::Regex;

use crate::config::models::{ServerConfig, ServiceConfig, parse_period};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate service name '{name}'")]
    DuplicateService { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for service in &config.services {
            if !seen.insert(service.name.as_str()) {
                errors.push(ValidationError::DuplicateService {
                    name: service.name.clone(),
                });
            }
            if let Err(mut service_errors) = Self::validate_service(service) {
                errors.append(&mut service_errors);
            }
        }

        for (field, value) in [
            ("global.proxy_timeout", &config.global.proxy_timeout),
            ("rate_limit.window", &config.rate_limit.window),
            ("cache.ttl", &config.cache.ttl),
            (
                "escalation.failed_auth_window",
                &config.escalation.failed_auth_window,
            ),
            (
                "escalation.failed_auth_block",
                &config.escalation.failed_auth_block,
            ),
            (
                "escalation.rate_exceed_window",
                &config.escalation.rate_exceed_window,
            ),
            (
                "escalation.rate_exceed_block",
                &config.escalation.rate_exceed_block,
            ),
            ("auth.token_ttl", &config.auth.token_ttl),
            ("stores.timeout", &config.stores.timeout),
        ] {
            if let Err(message) = parse_period(field, value) {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message,
                });
            }
        }

        for (field, value) in [
            ("rate_limit.max_requests", config.rate_limit.max_requests),
            ("escalation.max_failed_auth", config.escalation.max_failed_auth),
            (
                "escalation.max_rate_exceeded",
                config.escalation.max_rate_exceeded,
            ),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than zero".to_string(),
                });
            }
        }

        if config.cache.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.max_body_bytes".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }

        for method in &config.cache.methods {
            if Method::from_str(&method.to_ascii_uppercase()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "cache.methods".to_string(),
                    message: format!("Unknown HTTP method '{method}'"),
                });
            }
        }

        if config.needs_jwt_secret() && config.auth.jwt_secret.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.jwt_secret (required because routes or admin endpoints require auth)"
                    .to_string(),
            });
        }

        for (field, url, schemes) in [
            (
                "stores.redis_url",
                &config.stores.redis_url,
                &["redis", "rediss"][..],
            ),
            (
                "stores.database_url",
                &config.stores.database_url,
                &["postgres", "postgresql"][..],
            ),
        ] {
            if let Some(url) = url {
                if let Err(e) = Self::validate_store_url(field, url, schemes) {
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(service: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_service_name(&service.name) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_url(
            &service.base_url,
            &format!("service '{}' base_url", service.name),
        ) {
            errors.push(e);
        }

        if service.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("service '{}' routes", service.name),
            });
        }

        for (i, route) in service.routes.iter().enumerate() {
            let field = format!("service '{}' route {}", service.name, i + 1);

            if route.path.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{field} path"),
                });
            } else if route.path != "*" && !route.path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field} path"),
                    message: format!("Route path '{}' must start with '/' or be '*'", route.path),
                });
            } else if route
                .path
                .split('/')
                .any(|segment| segment.trim_end_matches('*').contains('*'))
            {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field} path"),
                    message: format!(
                        "Wildcard in '{}' must end its path segment",
                        route.path
                    ),
                });
            }

            if route.methods.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{field} methods"),
                });
            }
            for method in &route.methods {
                if Method::from_str(&method.to_ascii_uppercase()).is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field} methods"),
                        message: format!("Unknown HTTP method '{method}'"),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_service_name(name: &str) -> ValidationResult<()> {
        // Service names end up in headers and log fields.
        let name_regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").map_err(|e| {
            ValidationError::ValidationFailed {
                message: format!("Failed to compile service name regex: {e}"),
            }
        })?;

        if !name_regex.is_match(name) {
            return Err(ValidationError::InvalidField {
                field: "service name".to_string(),
                message: format!(
                    "'{name}' must start with a letter or digit and contain only letters, digits, '_', '.' or '-'"
                ),
            });
        }
        Ok(())
    }

    fn validate_url(url: &str, field_name: &str) -> ValidationResult<()> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidField {
                field: field_name.to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        match url::Url::parse(url) {
            Ok(parsed) if parsed.host_str().is_some() => Ok(()),
            Ok(_) => Err(ValidationError::InvalidField {
                field: field_name.to_string(),
                message: "URL must include a host".to_string(),
            }),
            Err(e) => Err(ValidationError::InvalidField {
                field: field_name.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_store_url(field: &str, url: &str, schemes: &[&str]) -> ValidationResult<()> {
        let parsed = url::Url::parse(url).map_err(|e| ValidationError::InvalidField {
            field: field.to_string(),
            message: format!("Invalid URL format: {e}"),
        })?;
        if !schemes.contains(&parsed.scheme()) {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!(
                    "Unsupported scheme '{}', expected one of {:?}",
                    parsed.scheme(),
                    schemes
                ),
            });
        }
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} configuration errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::RouteDefinition;

    fn route(path: &str, methods: &[&str]) -> RouteDefinition {
        RouteDefinition {
            path: path.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            requires_auth: Some(false),
            ..Default::default()
        }
    }

    fn base_config() -> ServerConfig {
        let mut config: ServerConfig = serde_json::from_str(r#"{ "listen_addr": "127.0.0.1:3000" }"#)
            .unwrap();
        config.admin.require_auth = false;
        config.services.push(ServiceConfig {
            name: "users".to_string(),
            base_url: "http://localhost:3001".to_string(),
            rate_limit: None,
            routes: vec![route("/users/:id", &["GET"])],
        });
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(ServerConfigValidator::validate(&base_config()).is_ok());
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = base_config();
        config.listen_addr = "invalid-address".to_string();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_route_without_path_or_methods_fails_fast() {
        let mut config = base_config();
        config.services[0].routes.push(RouteDefinition::default());

        let message = ServerConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("route 2 path"));
        assert!(message.contains("route 2 methods"));
    }

    #[test]
    fn test_wildcard_must_end_its_segment() {
        let mut config = base_config();
        config.services[0].routes = vec![route("/files/a*b/meta", &["GET"])];
        assert!(ServerConfigValidator::validate(&config).is_err());

        config.services[0].routes = vec![
            route("/files/*/meta", &["GET"]),
            route("/files/*", &["GET"]),
            route("*", &["GET"]),
        ];
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_duplicate_service_and_bad_url() {
        let mut config = base_config();
        let mut dup = config.services[0].clone();
        dup.base_url = "ftp://localhost".to_string();
        config.services.push(dup);

        let message = ServerConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("Duplicate service name 'users'"));
        assert!(message.contains("http:// or https://"));
    }

    #[test]
    fn test_secret_required_when_auth_is_used() {
        let mut config = base_config();
        config.services[0].routes[0].requires_auth = None;
        let message = ServerConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("auth.jwt_secret"));

        config.auth.jwt_secret = "s3cret".to_string();
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_bad_durations_and_store_urls() {
        let mut config = base_config();
        config.rate_limit.window = "fortnight".to_string();
        config.stores.redis_url = Some("http://localhost:6379".to_string());

        let message = ServerConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("rate_limit.window"));
        assert!(message.contains("stores.redis_url"));
    }
}
