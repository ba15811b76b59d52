use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Environment variables with this prefix override file values,
/// e.g. `TOLLGATE__AUTH__JWT_SECRET` or `TOLLGATE__STORES__REDIS_URL`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
global:
  default_rate_limit: true
  proxy_timeout: "2s"
services:
  - name: users
    base_url: "http://localhost:3001"
    routes:
      - path: "/users/:id"
        methods: ["GET", "PUT"]
        cache: true
      - path: "/users"
        methods: ["POST"]
        requires_auth: false
  - name: orders
    base_url: "http://localhost:3002"
    routes:
      - path: "/orders/*"
        methods: ["GET"]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.global.proxy_timeout, "2s");
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].name, "users");
        assert_eq!(config.services[1].name, "orders");
        assert_eq!(config.services[0].routes[0].cache, Some(true));
        assert_eq!(config.services[0].routes[1].requires_auth, Some(false));
    }

    #[tokio::test]
    async fn test_load_json_config_with_camel_case_keys() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "global": { "defaultRateLimit": false },
  "services": [
    {
      "name": "users",
      "baseUrl": "http://localhost:3001",
      "routes": [
        { "path": "/users/:id", "methods": ["GET"], "requiresAuth": false }
      ]
    }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(!config.global.default_rate_limit);
        assert_eq!(config.services[0].base_url, "http://localhost:3001");
        assert_eq!(config.services[0].routes[0].requires_auth, Some(false));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let result = load_config("/definitely/not/here/gateway.yaml").await;
        assert!(result.is_err());
    }
}
