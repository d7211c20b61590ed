//! Environment client configuration
//!
//! Everything here is fixed when the environment is built: socket URL,
//! backend dialect, credentials, and optional timing knobs. Configs are
//! stored as pretty-printed JSON.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::adapter::Dialect;
use super::error::ConfigError;

/// Default socket URL
pub const DEFAULT_SOCKET_URL: &str = "ws://localhost:8081/ws";

/// Seconds between keep-alive pings on backends that expect them
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 10;

/// Operations refused in read-only mode without a `permissionDenied` notification
pub const DEFAULT_SILENT_FAILURE_OPS: &[&str] = &["update_annotations", "remove_annotations"];

/// User name and password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name or tag
    pub user: String,
    /// Password
    pub password: String,
}

/// Configuration for an [`Environment`](super::Environment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// WebSocket URL of the backend API
    pub socket_url: String,

    /// Wire dialect spoken by the backend
    pub dialect: Dialect,

    /// Login credentials
    pub credentials: Option<Credentials>,

    /// Fail requests with no reply after this many milliseconds
    pub request_timeout_ms: Option<u64>,

    /// Keep-alive interval; ignored by dialects without a ping
    pub ping_interval_secs: Option<u64>,

    /// Refuse operations that modify the environment
    pub read_only: bool,

    /// Write operations refused quietly in read-only mode
    pub silent_failure_ops: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            dialect: Dialect::Go,
            credentials: None,
            request_timeout_ms: None,
            ping_interval_secs: Some(DEFAULT_PING_INTERVAL_SECS),
            read_only: false,
            silent_failure_ops: DEFAULT_SILENT_FAILURE_OPS
                .iter()
                .map(|op| op.to_string())
                .collect(),
        }
    }
}

impl EnvironmentConfig {
    /// Config for `socket_url` speaking `dialect`, other fields defaulted.
    pub fn new(socket_url: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            socket_url: socket_url.into(),
            dialect,
            ..Self::default()
        }
    }

    /// Builder-style credential setter.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Check the socket URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.socket_url).map_err(|err| ConfigError::InvalidUrl {
            url: self.socket_url.clone(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" | "memory" => Ok(()),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Request timeout, if configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Ping interval, if configured and non-zero.
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Whether a refused `operation` should stay quiet.
    pub fn is_silent_failure(&self, operation: &str) -> bool {
        self.silent_failure_ops.iter().any(|op| op == operation)
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<EnvironmentConfig, ConfigError> {
    let data = fs::read(path)
        .map_err(|err| ConfigError::File(format!("failed to read {}: {err}", path.display())))?;
    let config: EnvironmentConfig = serde_json::from_slice(&data)
        .map_err(|err| ConfigError::File(format!("failed to parse {}: {err}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write a config file, creating parent directories as needed.
pub fn write_config(path: &Path, config: &EnvironmentConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            ConfigError::File(format!("failed to create {}: {err}", parent.display()))
        })?;
    }
    let data = serde_json::to_vec_pretty(config)
        .map_err(|err| ConfigError::File(format!("failed to encode config: {err}")))?;
    fs::write(path, data)
        .map_err(|err| ConfigError::File(format!("failed to write {}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("env.json");
        let config = EnvironmentConfig::new("wss://example.com:17070/", Dialect::Python)
            .with_credentials("admin", "secret");

        write_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("env.json");
        fs::write(&path, r#"{"dialect": "python"}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.dialect, Dialect::Python);
        assert_eq!(config.socket_url, DEFAULT_SOCKET_URL);
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(10)));
        assert!(config.is_silent_failure("update_annotations"));
    }

    #[test]
    fn bad_urls_are_rejected() {
        let config = EnvironmentConfig::new("http://example.com", Dialect::Go);
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedScheme("http".to_string()))
        );
        let config = EnvironmentConfig::new("not a url", Dialect::Go);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn unknown_dialect_fails_to_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("env.json");
        fs::write(&path, r#"{"dialect": "ruby"}"#).unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::File(_))));
    }
}
