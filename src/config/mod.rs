//! Engine configuration loaded from TOML.
//!
//! Every key is optional; an empty document yields the defaults below.
//!
//! ```toml
//! listen = "0.0.0.0:3000"
//! secure_headers = true
//!
//! [rate_limit]
//! window_secs = 60
//! max_requests = 60
//! key_header = "X-Forwarded-For"
//!
//! [auth]
//! secret = "supersecret"
//! prefix = "/api"
//!
//! [cors]
//! origins = ["https://example.com"]
//!
//! [schemas.todo]
//! required = ["title"]
//! properties = { title = { type = "string" }, completed = { type = "boolean" } }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::middleware::Stage;
use crate::security::{Cors, RateLimiter, Schema, SecureHeaders, TokenAuth};

/// Errors from loading an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_requests: u32,
    /// Header to key clients by instead of the peer address.
    pub key_header: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            max_requests: 60,
            key_header: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub secret: String,
    #[serde(default = "default_auth_prefix")]
    pub prefix: String,
}

fn default_auth_prefix() -> String {
    "/api".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: vec!["*".to_owned()],
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listen: String,
    pub secure_headers: bool,
    pub rate_limit: RateLimitConfig,
    /// Token authentication; disabled when absent.
    pub auth: Option<AuthConfig>,
    pub cors: CorsConfig,
    /// Named body schemas, attached to routes with [`schema`](Self::schema).
    pub schemas: HashMap<String, Schema>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_owned(),
            secure_headers: true,
            rate_limit: RateLimitConfig::default(),
            auth: None,
            cors: CorsConfig::default(),
            schemas: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or wrongly typed keys,
    /// [`ConfigError::Invalid`] when values are out of range.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks value ranges that the type system does not.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.enabled {
            if self.rate_limit.window_secs == 0 {
                return Err(ConfigError::Invalid("rate_limit.window_secs must be at least 1".into()));
            }
            if self.rate_limit.max_requests == 0 {
                return Err(ConfigError::Invalid("rate_limit.max_requests must be at least 1".into()));
            }
        }
        if let Some(auth) = &self.auth {
            if auth.secret.is_empty() {
                return Err(ConfigError::Invalid("auth.secret must not be empty".into()));
            }
            if !auth.prefix.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "auth.prefix {:?} must start with '/'",
                    auth.prefix
                )));
            }
        }
        Ok(())
    }

    /// The app-wide guards this configuration enables, in execution order:
    /// CORS, secure headers, rate limiter, token authentication.
    pub fn guards(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        if self.cors.enabled && !self.cors.origins.is_empty() {
            let cors = self
                .cors
                .origins
                .iter()
                .fold(Cors::new(), |cors, origin| cors.allow_origin(origin.as_str()));
            stages.push(cors.into());
        }
        if self.secure_headers {
            stages.push(SecureHeaders::new().into());
        }
        if self.rate_limit.enabled {
            let mut limiter = RateLimiter::new(
                self.rate_limit.max_requests,
                Duration::from_secs(self.rate_limit.window_secs),
            );
            if let Some(header) = &self.rate_limit.key_header {
                limiter = limiter.key_by_header(header.as_str());
            }
            stages.push(limiter.into());
        }
        if let Some(auth) = &self.auth {
            stages.push(TokenAuth::new(&auth.secret).scope(auth.prefix.as_str()).into());
        }
        stages
    }

    /// A validation stage for the named schema, if configured.
    pub fn schema(&self, name: &str) -> Option<Stage> {
        self.schemas.get(name).cloned().map(Stage::from)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.listen, "127.0.0.1:3000");
        assert_eq!(config.rate_limit.max_requests, 60);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert!(config.auth.is_none());
        let names: Vec<_> = config.guards().iter().map(Stage::name).collect();
        assert_eq!(names, ["cors", "secure-headers", "rate-limit"]);
    }

    #[test]
    fn full_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            listen = "0.0.0.0:8080"
            secure_headers = false

            [rate_limit]
            max_requests = 5
            key_header = "X-Forwarded-For"

            [auth]
            secret = "supersecret"

            [cors]
            enabled = false

            [schemas.todo]
            required = ["title"]
            properties = { title = { type = "string" }, completed = { type = "boolean" } }
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.auth.as_ref().map(|a| a.prefix.as_str()), Some("/api"));
        let names: Vec<_> = config.guards().iter().map(Stage::name).collect();
        assert_eq!(names, ["rate-limit", "authenticate"]);

        let schema = &config.schemas["todo"];
        assert_eq!(
            schema.validate(&json!({ "completed": 1 })).unwrap_err(),
            vec!["title is required", "completed must be boolean"]
        );
        assert!(config.schema("todo").is_some());
        assert!(config.schema("missing").is_none());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("[rate_limit]\nmax_requests = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[auth]\nsecret = \"\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[auth]\nsecret = \"s\"\nprefix = \"api\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("listen = 3000"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { ref path, .. } if path.ends_with("here.toml")));
    }
}
