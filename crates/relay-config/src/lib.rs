//! # relay-config
//!
//! Configuration system for the Relay run core. Reads from `relay.toml` and
//! environment variables, in that precedence order.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::{ConfigLoader, ReloadHook};
pub use schema::RelayConfig;
pub use schema::{
    AdmissionConfig, AgentConfig, AuthConfig, ConfigWarning, LoggingConfig, ProviderConfig,
    SelectionStrategy, SessionConfig, SubagentConfig, WarningSeverity, resolve_context_window,
};
