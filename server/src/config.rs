//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL
    pub database_url: String,
    /// Maximum inbound frame size in bytes
    pub max_message_size: usize,
    /// WebSocket ping interval in seconds
    pub ws_ping_interval: u64,
    /// Maximum total WebSocket connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket connections per IP address (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Bearer token for /admin/* endpoints (None = endpoints hidden)
    pub admin_token: Option<String>,
    /// Seconds to wait for `identify` before dropping the connection
    pub auth_timeout_seconds: u64,
    /// Shared secret for verifying bearer credentials (None = trust announced ids)
    pub auth_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: "sqlite://./data/parley.db".to_string(),
            max_message_size: 64 * 1024,
            ws_ping_interval: 30,
            max_connections: 2000,
            max_connections_per_ip: 10,
            cors_origins: None,
            admin_token: None,
            auth_timeout_seconds: 10,
            auth_secret: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = ServerConfig::default();

        let config = ServerConfig {
            host: env::var("PARLEY_HOST").unwrap_or(defaults.host),
            port: parse_var("PARLEY_PORT", defaults.port)?,
            database_url: env::var("PARLEY_DATABASE_URL").unwrap_or(defaults.database_url),
            max_message_size: parse_var("PARLEY_MAX_MESSAGE_SIZE", defaults.max_message_size)?,
            ws_ping_interval: parse_var("PARLEY_WS_PING_INTERVAL", defaults.ws_ping_interval)?,
            max_connections: parse_var("PARLEY_MAX_CONNECTIONS", defaults.max_connections)?,
            max_connections_per_ip: parse_var(
                "PARLEY_MAX_CONNECTIONS_PER_IP",
                defaults.max_connections_per_ip,
            )?,
            cors_origins: env::var("PARLEY_CORS_ORIGINS").ok(),
            admin_token: env::var("PARLEY_ADMIN_TOKEN").ok(),
            auth_timeout_seconds: parse_var("PARLEY_AUTH_TIMEOUT", defaults.auth_timeout_seconds)?,
            auth_secret: env::var("PARLEY_AUTH_SECRET").ok().filter(|s| !s.is_empty()),
        };

        if config.ws_ping_interval == 0 {
            anyhow::bail!("PARLEY_WS_PING_INTERVAL must be greater than zero");
        }

        Ok(config)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}
