//! Public API for configuration

pub mod loader;
pub mod model;

// Re-export the main entrypoints:
pub use loader::{apply_overrides, from_toml_str, load, require_agent_identity};
pub use model::{
    AgentConfig, AgentContext, BackoffConfig, CollectorConfig, Config, ConfigError,
    DatabaseConfig, InjectionPolicy, LoggingConfig, MetricsConfig, TransportConfig,
};
