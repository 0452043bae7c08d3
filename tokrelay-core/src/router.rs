use std::sync::Arc;

use regex::Regex;

use crate::config::{Config, RoutingRule};
use crate::error::{CoreResult, RelayError};
use crate::provider_factory::UpstreamRegistry;
use crate::upstream::UpstreamAdapter;

/// Compiled routing rule
#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    provider: String,
}

/// Resolves a model string to a provider name, then fetches the upstream
/// from the registry.
#[derive(Debug)]
pub struct RoutingResolver {
    rules: Vec<CompiledRule>,
    default_provider: String,
}

impl RoutingResolver {
    /// Build a resolver by compiling regexes from config.
    pub fn new(cfg: &Config) -> CoreResult<Self> {
        let mut rules = Vec::new();
        for RoutingRule { model, provider } in &cfg.routing.rules {
            let regex = Regex::new(model).map_err(|e| {
                RelayError::Validation(format!("invalid routing regex '{model}': {e}"))
            })?;
            rules.push(CompiledRule {
                regex,
                provider: provider.clone(),
            });
        }
        Ok(Self {
            rules,
            default_provider: cfg.routing.default.clone(),
        })
    }

    fn pick_provider_name<'a>(&'a self, model: &str) -> &'a str {
        for r in &self.rules {
            if r.regex.is_match(model) {
                return &r.provider;
            }
        }
        &self.default_provider
    }

    /// Select the upstream for the given model.
    pub fn select(
        &self,
        reg: &UpstreamRegistry,
        model: &str,
    ) -> CoreResult<Arc<dyn UpstreamAdapter>> {
        let name = self.pick_provider_name(model);
        reg.get(name).ok_or_else(|| {
            RelayError::Validation(format!(
                "provider '{name}' for model '{model}' is not available"
            ))
        })
    }
}
