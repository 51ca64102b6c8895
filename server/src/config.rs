//! Configuration for the wire protocol server
//!
//! Settings come from defaults, an optional configuration file and
//! `DUCKPG_`-prefixed environment variables, in that order of precedence.
//! Nested keys use a double underscore: `DUCKPG_TLS__CERT_FILE`.

use crate::error::{PgWireError, Result};
use crate::protocol::auth::{AuthConfig, AuthMethod};
use crate::protocol::codec::DEFAULT_MAX_MESSAGE_LENGTH;
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DUCKPG";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,

    /// Maximum number of concurrent client connections
    pub max_connections: usize,

    /// Largest accepted message, including its length field
    pub max_message_length: usize,

    /// Seconds a client may stay silent before it is disconnected; 0 disables
    pub idle_timeout_secs: u64,

    /// Seconds allowed from accept until authentication completes; 0 disables
    pub startup_timeout_secs: u64,

    /// TLS configuration
    pub tls: TlsConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Database file, or `:memory:`
    pub database_path: String,

    /// Version reported in the `server_version` parameter
    pub server_version: String,

    /// Default log filter
    pub log_level: String,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_file: Option<PathBuf>,

    /// PEM private key
    pub key_file: Option<PathBuf>,

    /// Refuse clients that do not negotiate TLS
    pub require_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 15432)),
            max_connections: 100,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            idle_timeout_secs: 0,
            startup_timeout_secs: 60,
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            database_path: ":memory:".to_string(),
            server_version: "14.0".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from an optional file and the environment
    ///
    /// The file format follows the extension (`.toml`, `.yaml`, `.json`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .source(env),
        );

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration for local development
    pub fn for_development() -> Self {
        Self {
            log_level: "debug".to_string(),
            auth: AuthConfig {
                method: AuthMethod::CleartextPassword,
                users: HashMap::from([("duckdb".to_string(), "duckdb".to_string())]),
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing
    pub fn for_testing() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: 10,
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Idle timeout, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Deadline for negotiation and authentication, if enabled
    pub fn startup_timeout(&self) -> Option<Duration> {
        match self.startup_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Check the configuration for contradictions
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(PgWireError::Config("max_connections must be at least 1".to_string()));
        }
        if self.max_message_length < 1024 {
            return Err(PgWireError::Config(format!(
                "max_message_length {} is too small",
                self.max_message_length
            )));
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(PgWireError::Config(
                "tls.cert_file and tls.key_file must be set together".to_string(),
            ));
        }
        if self.tls.require_tls && self.tls.cert_file.is_none() {
            return Err(PgWireError::Config(
                "tls.require_tls is set but no certificate is configured".to_string(),
            ));
        }
        if self.auth.method != AuthMethod::Trust && self.auth.users.is_empty() {
            warn!("Authentication method {} has no users configured", self.auth.method);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr.port(), 15432);
        assert_eq!(config.auth.method, AuthMethod::Trust);
        assert_eq!(config.database_path, ":memory:");
        assert!(config.idle_timeout().is_none());
        assert_eq!(config.startup_timeout(), Some(Duration::from_secs(60)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
listen_addr = "0.0.0.0:6543"
max_connections = 5
idle_timeout_secs = 30

[auth]
method = "scram-sha-256"
users = {{ alice = "secret" }}
"#
        )
        .unwrap();

        let config = ServerConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap();
        assert_eq!(config.listen_addr.port(), 6543);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.auth.method, AuthMethod::ScramSha256);
        assert_eq!(config.auth.users.get("alice").map(String::as_str), Some("secret"));
        assert_eq!(config.server_version, "14.0");
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let body = serde_json::json!({
            "database_path": "/var/lib/duckpg/data.db",
            "auth": { "method": "md5", "users": { "bob": "pw" } }
        });
        write!(file, "{}", body).unwrap();

        let config = ServerConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap();
        assert_eq!(config.database_path, "/var/lib/duckpg/data.db");
        assert_eq!(config.auth.method, AuthMethod::Md5Password);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_connections = 5").unwrap();

        let env = HashMap::from([
            ("DUCKPG_MAX_CONNECTIONS".to_string(), "7".to_string()),
            ("DUCKPG_TLS__REQUIRE_TLS".to_string(), "false".to_string()),
            ("DUCKPG_STARTUP_TIMEOUT_SECS".to_string(), "0".to_string()),
        ]);
        let config = ServerConfig::load_with_env(Some(file.path()), Some(env)).unwrap();
        assert_eq!(config.max_connections, 7);
        assert!(config.startup_timeout().is_none());
    }

    #[test]
    fn test_require_tls_needs_certificate() {
        let mut config = ServerConfig::for_testing();
        config.tls.require_tls = true;
        assert!(matches!(config.validate(), Err(PgWireError::Config(_))));
    }

    #[test]
    fn test_half_configured_tls() {
        let mut config = ServerConfig::for_testing();
        config.tls.key_file = Some(PathBuf::from("server.key"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_connections_rejected() {
        let mut config = ServerConfig::for_testing();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }
}
