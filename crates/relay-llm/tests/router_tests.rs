#[cfg(test)]
mod tests {
    use relay_core::RelayError;
    use relay_llm::mock::MockProvider;
    use relay_llm::provider::{LlmProvider, LlmRequest};
    use relay_llm::router::ProviderRegistry;
    use std::sync::Arc;

    // ── Resolution ─────────────────────────────────────────────

    #[test]
    fn test_resolve_with_prefix() {
        let registry = ProviderRegistry::new().with_provider(Arc::new(MockProvider::new("openai")));
        let (provider, target) = registry.resolve("OpenAI/gpt-4o").unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(target.model, "gpt-4o");
    }

    #[test]
    fn test_resolve_bare_model_from_model_list() {
        let registry = ProviderRegistry::new().with_provider(Arc::new(
            MockProvider::new("anthropic").with_models(&["claude-sonnet-4-5"]),
        ));
        let (provider, target) = registry.resolve("claude-sonnet-4-5").unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(target.to_string(), "anthropic/claude-sonnet-4-5");
    }

    #[test]
    fn test_model_not_found() {
        let registry = ProviderRegistry::new();
        let err = registry.resolve("nonexistent/model").err().unwrap();
        assert!(matches!(err, RelayError::ModelNotFound(_)));
    }

    #[test]
    fn test_re_registering_replaces_provider() {
        let mut registry = ProviderRegistry::new();
        registry.add_provider(Arc::new(MockProvider::new("openai").with_models(&["a"])));
        registry.add_provider(Arc::new(MockProvider::new("openai").with_models(&["b"])));
        assert_eq!(registry.names(), vec!["openai".to_string()]);
        assert_eq!(registry.get("openai").unwrap().models(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_resolved_provider_completes() {
        let registry = ProviderRegistry::new()
            .with_provider(Arc::new(MockProvider::new("testprovider").with_response("hi")));
        let (provider, target) = registry.resolve("testprovider/gpt-4o").unwrap();
        let req = LlmRequest {
            model: target.model,
            ..Default::default()
        };
        let resp = provider.complete(&req).await.unwrap();
        assert_eq!(resp.text, "hi");
    }
}
