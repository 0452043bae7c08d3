use std::{collections::HashMap, sync::Arc};

use secrecy::SecretString;

use crate::config::{Config, ProviderCfg};
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::providers::anthropic::{ANTHROPIC_BASE, Anthropic};
use crate::providers::openai::{OPENAI_BASE, OPENROUTER_BASE, OpenAiCompatible};
use crate::upstream::{Scripted, UpstreamAdapter};

/// Registry of concrete upstream instances by name.
/// Names correspond to config keys ("openai", "anthropic", "openrouter") plus "null".
#[derive(Default)]
pub struct UpstreamRegistry {
    upstreams: HashMap<String, Arc<dyn UpstreamAdapter>>,
}

impl UpstreamRegistry {
    /// Build a registry from configuration. `null` is always present; a configured provider is
    /// registered only when its API key environment variable is set.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Self::from_config_with_env(cfg, |key| std::env::var(key).ok())
    }

    /// Same as [`from_config`](Self::from_config) with an injectable environment lookup.
    pub fn from_config_with_env<F>(cfg: &Config, env: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reg = Self::default();
        reg.insert("null", Arc::new(Scripted::echo()));

        let key_for = |p: &Option<ProviderCfg>, name: &str| -> Option<(SecretString, Option<String>)> {
            let p = p.as_ref()?;
            match env(&p.api_key_env) {
                Some(key) if !key.is_empty() => Some((SecretString::from(key), p.base.clone())),
                _ => {
                    tracing::warn!(provider = name, env = %p.api_key_env, "api key not set; provider disabled");
                    None
                }
            }
        };

        let openai = key_for(&cfg.providers.openai, "openai");
        let anthropic = key_for(&cfg.providers.anthropic, "anthropic");
        let openrouter = key_for(&cfg.providers.openrouter, "openrouter");
        if openai.is_none() && anthropic.is_none() && openrouter.is_none() {
            return Ok(reg);
        }

        let http = HttpClient::new(&cfg.http)?;
        if let Some((key, base)) = openai {
            let base = base.unwrap_or_else(|| OPENAI_BASE.to_string());
            reg.insert(
                "openai",
                Arc::new(OpenAiCompatible::new(http.clone(), key, base, "openai")),
            );
        }
        if let Some((key, base)) = openrouter {
            let base = base.unwrap_or_else(|| OPENROUTER_BASE.to_string());
            reg.insert(
                "openrouter",
                Arc::new(OpenAiCompatible::new(http.clone(), key, base, "openrouter")),
            );
        }
        if let Some((key, base)) = anthropic {
            let base = base.unwrap_or_else(|| ANTHROPIC_BASE.to_string());
            reg.insert("anthropic", Arc::new(Anthropic::new(http, key, base)));
        }
        Ok(reg)
    }

    /// Register (or replace) an upstream under `name`.
    pub fn insert(&mut self, name: impl Into<String>, upstream: Arc<dyn UpstreamAdapter>) {
        self.upstreams.insert(name.into(), upstream);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, upstream: Arc<dyn UpstreamAdapter>) -> Self {
        self.insert(name, upstream);
        self
    }

    /// Get an upstream by name (e.g., "openai", "anthropic", "null").
    pub fn get(&self, name: &str) -> Option<Arc<dyn UpstreamAdapter>> {
        self.upstreams.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.upstreams.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
