use std::sync::Arc;
use tracing::info;

use crate::provider::LlmProvider;
use relay_core::{ModelRef, RelayError, Result};

/// Registered upstream providers, looked up by model reference.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. A later registration under the same name replaces the earlier one.
    pub fn add_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        self.providers
            .retain(|p| !p.name().eq_ignore_ascii_case(&name));
        info!(provider = %name, "registered LLM provider");
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.add_provider(provider);
        self
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(provider))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Find the provider for a model string.
    ///
    /// Accepts `provider/model`, or a bare model name that some provider lists.
    pub fn resolve(&self, model: &str) -> Result<(Arc<dyn LlmProvider>, ModelRef)> {
        if let Some(target) = ModelRef::parse(model)
            && let Some(provider) = self.get(&target.provider)
        {
            return Ok((provider, target));
        }
        // Fallback: try each provider's model list
        for p in &self.providers {
            if p.models().iter().any(|m| m == model) {
                return Ok((Arc::clone(p), ModelRef::new(p.name(), model)));
            }
        }
        Err(RelayError::ModelNotFound(model.to_string()))
    }

    /// Resolve an already-parsed reference.
    pub fn resolve_ref(&self, target: &ModelRef) -> Result<Arc<dyn LlmProvider>> {
        self.get(&target.provider)
            .ok_or_else(|| RelayError::ProviderNotFound(target.provider.clone()))
    }
}
