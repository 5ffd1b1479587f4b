//! Server configuration
//!
//! Loads `gamelink.toml`. A missing file yields the defaults; every field in
//! the file is optional except `auth.secret`, which must be set (in the file
//! or on the command line) before the server will start.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ws::{ClientOptions, ConnectionOptions};

/// Default configuration file name
pub const CONFIG_FILE: &str = "gamelink.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path accepted for upgrades
    pub path: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
            path: "/".to_string(),
        }
    }
}

impl ListenConfig {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// `[auth]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret for client tokens
    pub secret: String,
    /// Expected `sub` claim
    pub subject: String,
    /// Header carrying the bearer token
    pub token_header: String,
    /// Header carrying the player identity
    pub identity_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            subject: "game-client".to_string(),
            token_header: "Authorization".to_string(),
            identity_header: "Player-ID".to_string(),
        }
    }
}

/// `[transport]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on reading the upgrade request or response
    pub handshake_timeout_ms: u64,
    /// Bound on the size of the upgrade request or response head
    pub max_handshake_bytes: usize,
    /// Largest accepted inbound frame payload
    pub max_message_bytes: u64,
    /// Encoded frames buffered per connection
    pub write_queue_capacity: usize,
    /// Received messages buffered per connection awaiting dispatch
    pub inbound_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let connection = ConnectionOptions::default();
        Self {
            handshake_timeout_ms: 5000,
            max_handshake_bytes: 8192,
            max_message_bytes: connection.max_message_bytes,
            write_queue_capacity: connection.write_queue_capacity,
            inbound_queue_capacity: 64,
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Per-connection options derived from this section
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_message_bytes: self.max_message_bytes,
            write_queue_capacity: self.write_queue_capacity,
        }
    }

    /// Options for outbound client connections
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            handshake_timeout: self.handshake_timeout(),
            max_handshake_bytes: self.max_handshake_bytes,
            inbound_queue_capacity: self.inbound_queue_capacity,
            connection: self.connection_options(),
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// Load configuration from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Set the bind address
    pub fn with_bind(mut self, bind: Option<String>) -> Self {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    /// Set the token secret
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        if let Some(secret) = secret {
            self.auth.secret = secret;
        }
        self
    }

    /// Check the settings the server cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.secret must be set (config file, --secret or GAMELINK_SECRET)".to_string(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/', got '{}'",
                self.server.path
            )));
        }
        if self.transport.write_queue_capacity == 0 || self.transport.inbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "transport queue capacities must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();

        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.server.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.auth.identity_header, "Player-ID");
        assert_eq!(config.transport.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
[server]
port = 7777

[auth]
secret = "s3cret"
subject = "pokemon-client"

[transport]
max_message_bytes = 1024
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 7777);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.auth.secret, "s3cret");
        assert_eq!(config.auth.subject, "pokemon-client");
        assert_eq!(config.auth.token_header, "Authorization");
        assert_eq!(config.transport.connection_options().max_message_bytes, 1024);
        assert_eq!(config.transport.write_queue_capacity, 256);
        assert!(config.validate().is_ok());

        let client = config.transport.client_options();
        assert_eq!(client.connection.max_message_bytes, 1024);
        assert_eq!(client.handshake_timeout, Duration::from_secs(5));
        assert_eq!(client.inbound_queue_capacity, 64);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[server\nport = ").unwrap();

        assert!(matches!(ServerConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_cli_overrides() {
        let config = ServerConfig::default()
            .with_bind(Some("0.0.0.0".to_string()))
            .with_port(Some(8080))
            .with_secret(Some("secret".to_string()))
            .with_port(None);

        assert_eq!(config.server.socket_addr(), "0.0.0.0:8080");
        assert_eq!(config.auth.secret, "secret");
    }

    #[test]
    fn test_validate_requires_secret() {
        let result = ServerConfig::default().validate();
        assert!(result.unwrap_err().to_string().contains("auth.secret"));
    }

    #[test]
    fn test_validate_path_and_queues() {
        let mut config = ServerConfig::default().with_secret(Some("x".to_string()));
        config.server.path = "game".to_string();
        assert!(config.validate().is_err());

        config.server.path = "/game".to_string();
        config.transport.inbound_queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
