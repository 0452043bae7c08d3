use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Providers {
    pub openai: Option<ProviderCfg>,
    pub anthropic: Option<ProviderCfg>,
    pub openrouter: Option<ProviderCfg>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderCfg {
    /// Name of the environment variable that contains the API key.
    pub api_key_env: String,
    /// Override for the provider's base URL (no trailing slash).
    #[serde(default)]
    pub base: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    /// Listen address, e.g. 127.0.0.1:8787
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Seconds between keep-alive comment frames while a stream is open.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Frames the relay may queue ahead of the socket before it waits.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Model used when a request does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            heartbeat_secs: default_heartbeat_secs(),
            channel_capacity: default_channel_capacity(),
            default_model: default_model(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_channel_capacity() -> usize {
    16
}
fn default_model() -> String {
    "echo".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Regex applied to the model name, e.g. ^gpt-.*
    pub model: String,
    /// Provider to route to when this rule matches
    pub provider: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoutingCfg {
    pub default: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

impl Default for RoutingCfg {
    fn default() -> Self {
        Self {
            default: "null".into(),
            rules: vec![],
        }
    }
}

/// Defaults describe a runnable relay that answers every model with the `null` echo upstream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub providers: Providers,
    #[serde(default)]
    pub routing: RoutingCfg,
    /// Upstream HTTP client configuration. Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::RelayError::from)?;
        let s =
            std::str::from_utf8(&bytes).map_err(|e| crate::error::RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::RelayError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> crate::error::CoreResult<()> {
        if self.server.heartbeat_secs == 0 {
            return Err(crate::error::RelayError::Validation(
                "server.heartbeat_secs must be at least 1".into(),
            ));
        }
        if self.server.channel_capacity == 0 {
            return Err(crate::error::RelayError::Validation(
                "server.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
