//! Relay configuration.
//!
//! Values come from the process environment (optionally seeded from a `.env` file by the
//! binary). Every field has a default, so an empty environment yields a working local setup
//! that talks to a backend on `localhost:5001`.

use crate::error::{RelayError, Result};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5001/ai-chat";
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &["http://localhost:3000", "http://localhost:5173"];

const ENV_BIND: &str = "CHAT_RELAY_BIND";
const ENV_BACKEND_URL: &str = "CHAT_RELAY_BACKEND_URL";
const ENV_BACKEND_TIMEOUT: &str = "CHAT_RELAY_BACKEND_TIMEOUT_SECS";
const ENV_SEND_TIMEOUT: &str = "CHAT_RELAY_SEND_TIMEOUT_MS";
const ENV_ALLOWED_ORIGINS: &str = "CHAT_RELAY_ALLOWED_ORIGINS";

/// Configuration for the relay server, its hub and its inference backend
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub backend_url: String,
    /// Deadline for a single backend call. `None` leaves the HTTP client default in place.
    pub backend_timeout: Option<Duration>,
    /// How long one client may hold up a broadcast before it is dropped from the hub.
    pub send_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            backend_timeout: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect(),
        }
    }
}

impl RelayConfig {
    /// Build the configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Unset or blank keys fall back to their defaults; malformed values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(bind) = get(ENV_BIND) {
            config.bind_addr = bind.parse().map_err(|e| {
                RelayError::ConfigError(format!("{} '{}': {}", ENV_BIND, bind, e))
            })?;
        }

        if let Some(url) = get(ENV_BACKEND_URL) {
            config.backend_url = url;
        }

        if let Some(secs) = get(ENV_BACKEND_TIMEOUT) {
            let secs: u64 = secs.parse().map_err(|e| {
                RelayError::ConfigError(format!("{} '{}': {}", ENV_BACKEND_TIMEOUT, secs, e))
            })?;
            config.backend_timeout = Some(Duration::from_secs(secs));
        }

        if let Some(ms) = get(ENV_SEND_TIMEOUT) {
            let ms: u64 = ms.parse().map_err(|e| {
                RelayError::ConfigError(format!("{} '{}': {}", ENV_SEND_TIMEOUT, ms, e))
            })?;
            config.send_timeout = Duration::from_millis(ms);
        }

        if let Some(origins) = get(ENV_ALLOWED_ORIGINS) {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values that cannot be caught by parsing alone
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.backend_url).map_err(|e| {
            RelayError::ConfigError(format!("backend url '{}': {}", self.backend_url, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::ConfigError(format!(
                "backend url '{}' must use http or https",
                self.backend_url
            )));
        }

        if self.send_timeout.is_zero() {
            return Err(RelayError::ConfigError("send timeout must be non-zero".to_string()));
        }

        Ok(())
    }
}
