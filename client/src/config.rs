//! Client configuration

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the server, e.g. `http://127.0.0.1:8080`
    pub server_url: String,
    /// Directory holding the encrypted key file
    pub data_dir: PathBuf,
    /// Silence after the last keystroke before `stop-typing` is sent
    pub typing_timeout: Duration,
    /// How long a peer's `typing` stays visible without a refresh
    pub peer_typing_expiry: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            data_dir: default_data_dir(),
            typing_timeout: Duration::from_millis(2000),
            peer_typing_expiry: Duration::from_millis(2500),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = ClientConfig::default();
        Ok(Self {
            server_url: env::var("PARLEY_SERVER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.server_url),
            data_dir: env::var("PARLEY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            typing_timeout: millis_var("PARLEY_TYPING_TIMEOUT_MS", defaults.typing_timeout)?,
            peer_typing_expiry: millis_var(
                "PARLEY_PEER_TYPING_EXPIRY_MS",
                defaults.peer_typing_expiry,
            )?,
        })
    }

    /// WebSocket endpoint derived from the server URL
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.server_url.clone()
        };
        format!("{}/ws", base.trim_end_matches('/'))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}
