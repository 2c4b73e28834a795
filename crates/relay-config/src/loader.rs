use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use relay_core::{RelayError, Result};

use crate::schema::RelayConfig;

/// Callback run after every successful reload.
pub type ReloadHook = Arc<dyn Fn(&RelayConfig) + Send + Sync>;

/// Loads and optionally hot-reloads the Relay configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<RelayConfig>>,
    config_path: PathBuf,
    hooks: Arc<RwLock<Vec<ReloadHook>>>,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > RELAY_CONFIG env > ~/.relay/relay.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("RELAY_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
            .join("relay.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            Self::checked(Self::apply_env_overrides(RelayConfig::default()))?
        };

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            hooks: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Wrap an in-memory config (embedding, tests). `reload` reads from `path`.
    pub fn from_config(config: RelayConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: path.into(),
            hooks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Parse, apply env overrides, validate.
    fn read(path: &Path) -> Result<RelayConfig> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str::<RelayConfig>(&raw).map_err(|e| {
            RelayError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Self::checked(Self::apply_env_overrides(config))
    }

    /// Log warnings, fail on errors.
    fn checked(config: RelayConfig) -> Result<RelayConfig> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(config)
            }
            Err(e) => Err(RelayError::Config(e)),
        }
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> RelayConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<RelayConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Register a callback that runs after each successful reload.
    pub fn on_reload(&self, hook: ReloadHook) {
        self.hooks.write().push(hook);
    }

    /// Apply env var overrides (RELAY_AGENT_MODEL, RELAY_LOG_LEVEL, RELAY_REQUEST_TIMEOUT)
    fn apply_env_overrides(mut config: RelayConfig) -> RelayConfig {
        if let Ok(v) = std::env::var("RELAY_AGENT_MODEL") {
            config.agent.model = v;
        }
        if let Ok(v) = std::env::var("RELAY_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("RELAY_REQUEST_TIMEOUT")
            && let Ok(secs) = v.parse::<u64>()
        {
            config.agent.request_timeout_secs = secs;
        }
        config
    }

    fn install(
        config: &RwLock<RelayConfig>,
        hooks: &RwLock<Vec<ReloadHook>>,
        new_config: RelayConfig,
    ) {
        *config.write() = new_config.clone();
        for hook in hooks.read().iter() {
            hook(&new_config);
        }
    }

    /// Reload the config from disk. A config that fails validation is rejected
    /// and the current one kept.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(RelayError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::read(&self.config_path)?;
        Self::install(&self.config, &self.hooks, new_config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads when the config file changes.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let hooks = Arc::clone(&self.hooks);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
                match res {
                    Ok(event) => {
                        // Only react to modify/create events on our specific file
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            return;
                        }
                        let is_our_file = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == path_for_event.file_name());
                        if !is_our_file {
                            return;
                        }

                        info!("config file changed, reloading");
                        match ConfigLoader::read(&path_for_event) {
                            Ok(new_config) => {
                                ConfigLoader::install(&config, &hooks, new_config);
                                info!("configuration hot-reloaded successfully");
                            }
                            Err(e) => {
                                warn!(error = %e, "config file has errors, keeping current config");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "file watcher error");
                    }
                }
            })
            .map_err(|e| RelayError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| RelayError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
