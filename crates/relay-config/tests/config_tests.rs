#[cfg(test)]
mod tests {
    use relay_config::ConfigLoader;
    use relay_config::schema::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_relay_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.agent.model, "anthropic/claude-sonnet-4-5");
        assert_eq!(config.agent.retry_history_turns, 5);
        assert_eq!(config.agent.timeout_retries, 1);
        assert_eq!(config.agent.selection, SelectionStrategy::Primary);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_subagent_config_defaults() {
        let config = SubagentConfig::default();
        assert_eq!(config.wait_timeout_secs, 60);
        assert_eq!(config.probe_timeout_ms, 2000);
        assert_eq!(config.archive_after_minutes, 60);
        assert_eq!(config.max_children_per_session, 5);
    }

    #[test]
    fn test_admission_and_auth_defaults() {
        assert_eq!(AdmissionConfig::default().safety_timeout_secs, 600);
        let auth = AuthConfig::default();
        assert_eq!(auth.failure_window_hours, 24);
        assert_eq!(auth.max_cooldown_secs, 3600);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    #[test]
    fn test_default_config_validates() {
        let warnings = RelayConfig::default().validate().unwrap();
        assert!(
            warnings
                .iter()
                .all(|w| w.severity != WarningSeverity::Error)
        );
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = RelayConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: RelayConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.agent.model, config.agent.model);
        assert_eq!(restored.subagents.probe_timeout_ms, config.subagents.probe_timeout_ms);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[agent]
model = "openai/gpt-4o"
fallbacks = ["anthropic/claude-sonnet-4-5"]
selection = "sticky_session"

[providers.openai]
max_concurrent = 4

[providers.anthropic]
models = ["claude-sonnet-4-5"]

[auth.order]
openai = ["openai:work", "openai:personal"]
"#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.model, "openai/gpt-4o");
        assert_eq!(config.agent.selection, SelectionStrategy::StickySession);
        assert_eq!(
            config.model_chain(),
            vec!["openai/gpt-4o".to_string(), "anthropic/claude-sonnet-4-5".to_string()]
        );
        assert_eq!(config.auth.order["openai"].len(), 2);
        // Defaults should fill in
        assert_eq!(config.agent.max_tokens, 8192);
        assert_eq!(config.subagents.wait_timeout_secs, 60);

        let limits = config.admission_limits();
        assert_eq!(limits.get("openai"), Some(&4));
        assert!(!limits.contains_key("anthropic"));
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_zero_max_concurrent_is_error() {
        let mut config = RelayConfig::default();
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                max_concurrent: Some(0),
                models: vec![],
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.contains("providers.openai.max_concurrent"));
    }

    #[test]
    fn test_bare_model_is_warning() {
        let mut config = RelayConfig::default();
        config.agent.model = "gpt-4o".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "agent.model"));
    }

    #[test]
    fn test_probe_timeout_above_cap_is_info() {
        let mut config = RelayConfig::default();
        config.subagents.probe_timeout_ms = 5000;
        let warnings = config.validate().unwrap();
        let w = warnings
            .iter()
            .find(|w| w.field == "subagents.probe_timeout_ms")
            .unwrap();
        assert_eq!(w.severity, WarningSeverity::Info);
    }

    #[test]
    fn test_zero_retry_history_turns_is_error() {
        let mut config = RelayConfig::default();
        config.agent.retry_history_turns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warning_display_includes_hint() {
        let w = ConfigWarning {
            field: "agent.model".into(),
            message: "model is empty".into(),
            severity: WarningSeverity::Error,
            hint: Some("set it".into()),
        };
        let s = w.to_string();
        assert!(s.contains("agent.model: model is empty"));
        assert!(s.contains("↳ set it"));
    }

    #[test]
    fn test_resolve_context_window() {
        assert_eq!(resolve_context_window(50_000, "anything"), 50_000);
        assert_eq!(resolve_context_window(0, "claude-sonnet-4-5"), 200_000);
        assert_eq!(resolve_context_window(0, "gpt-4o-mini"), 128_000);
        assert_eq!(resolve_context_window(0, "mystery"), 128_000);
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[agent]
model = "openai/gpt-4o"
max_tokens = 4096

[subagents]
wait_timeout_secs = 30
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.agent.max_tokens, 4096);
        assert_eq!(config.subagents.wait_timeout_secs, 30);
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");
        std::fs::write(&config_path, "[admission]\nsafety_timeout_secs = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_reload_runs_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");
        std::fs::write(&config_path, "[providers.openai]\nmax_concurrent = 2\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().admission_limits().get("openai"), Some(&2));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_hook = seen.clone();
        loader.on_reload(Arc::new(move |cfg: &RelayConfig| {
            let limit = cfg.admission_limits().get("openai").copied().unwrap_or(0);
            seen_hook.store(limit, Ordering::SeqCst);
        }));

        std::fs::write(&config_path, "[providers.openai]\nmax_concurrent = 7\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(loader.get().admission_limits().get("openai"), Some(&7));
    }

    #[test]
    fn test_config_loader_reload_keeps_config_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");
        std::fs::write(&config_path, "[agent]\nmodel = \"openai/gpt-4o\"\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();

        std::fs::write(&config_path, "[agent]\ntemperature = 9.0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().agent.model, "openai/gpt-4o");
    }

    #[test]
    fn test_from_config_snapshot() {
        let mut config = RelayConfig::default();
        config.agent.timeout_retries = 3;
        let loader = ConfigLoader::from_config(config, "/tmp/relay-unused.toml");
        assert_eq!(loader.get().agent.timeout_retries, 3);
        assert_eq!(loader.shared().read().agent.timeout_retries, 3);
    }
}
