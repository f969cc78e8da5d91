//! Server configuration.
//!
//! Plain structs with defaults; [`ServerConfig::from_env`] layers
//! `PADCAST_*` environment variables on top.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::registry::RegistryConfig;

pub const ENV_BIND_ADDR: &str = "PADCAST_BIND_ADDR";
pub const ENV_WEB_ROOT: &str = "PADCAST_WEB_ROOT";
pub const ENV_REAP_INTERVAL_SECS: &str = "PADCAST_REAP_INTERVAL_SECS";
pub const ENV_IDLE_THRESHOLD_SECS: &str = "PADCAST_IDLE_THRESHOLD_SECS";
pub const ENV_UPDATE_QUEUE: &str = "PADCAST_UPDATE_QUEUE";
pub const ENV_CLIENT_BUFFER: &str = "PADCAST_CLIENT_BUFFER";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: expected a positive integer")]
    Invalid { key: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory holding `templates/` and `static/` (None = API only)
    pub web_root: Option<PathBuf>,
    /// Document registry tuning
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            web_root: None,
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PADCAST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or empty keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(addr) = get(ENV_BIND_ADDR) {
            config.bind_addr = addr.trim().to_string();
        }
        if let Some(root) = get(ENV_WEB_ROOT) {
            config.web_root = Some(PathBuf::from(root));
        }
        if let Some(v) = get(ENV_REAP_INTERVAL_SECS) {
            config.registry.reap_interval =
                Duration::from_secs(parse_positive(ENV_REAP_INTERVAL_SECS, &v)?);
        }
        if let Some(v) = get(ENV_IDLE_THRESHOLD_SECS) {
            config.registry.idle_threshold =
                Duration::from_secs(parse_positive(ENV_IDLE_THRESHOLD_SECS, &v)?);
        }
        if let Some(v) = get(ENV_UPDATE_QUEUE) {
            config.registry.update_queue_capacity = parse_positive(ENV_UPDATE_QUEUE, &v)? as usize;
        }
        if let Some(v) = get(ENV_CLIENT_BUFFER) {
            config.registry.client_buffer = parse_positive(ENV_CLIENT_BUFFER, &v)? as usize;
        }

        Ok(config)
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_web_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.web_root = Some(root.into());
        self
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}
