// src/config/model.rs

use serde::Deserialize;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use thiserror::Error;

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub agent:     AgentConfig,
    pub transport: TransportConfig,
    pub collector: CollectorConfig,
    pub logging:   LoggingConfig,
    pub database:  DatabaseConfig,
    pub metrics:   MetricsConfig,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[database]` table. The ledger is optional: with
/// `enable = false` alerts are only logged.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "yes")]                pub enable:             bool,
    #[serde(default = "default_db_path")]    pub path:               String,
    #[serde(default)]                        pub purge_on_restart:   bool,
    #[serde(default = "default_sync")]       pub synchronous:        String,
    #[serde(default = "default_journal")]    pub journal_size_limit: u64,
    #[serde(default = "default_checkpoint")] pub checkpoint_seconds: u64,
    #[serde(default = "default_flush")]      pub flush_interval_ms:  u64,
    #[serde(default = "default_batch")]      pub batch_size:         usize,
}
fn yes() -> bool { true }
fn default_db_path() -> String { "warden.db".into() }
fn default_sync() -> String { "NORMAL".into() }
fn default_journal() -> u64 { 50_000_000 }
fn default_checkpoint() -> u64 { 300 }
fn default_flush() -> u64 { 250 }
fn default_batch() -> usize { 256 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enable:             true,
            path:               default_db_path(),
            purge_on_restart:   false,
            synchronous:        default_sync(),
            journal_size_limit: default_journal(),
            checkpoint_seconds: default_checkpoint(),
            flush_interval_ms:  default_flush(),
            batch_size:         default_batch(),
        }
    }
}

/// Mirror of the `[metrics]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus scrape address; no exporter when absent.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

/// `[agent]` after validation.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub protected_pid:           i32,
    pub port_name:               String,
    pub receivers:               usize,
    pub workers:                 usize,
    pub queue_capacity:          usize,
    pub detector_queue_capacity: usize,
    pub injection_policy:        InjectionPolicy,
}

/// Reconnect schedule for the collector link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max:     Duration,
    pub jitter:  Duration,
}

/// `[transport]` after validation.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint:           String,
    pub ping_interval:      Duration,
    pub write_timeout:      Duration,
    pub ping_write_timeout: Duration,
    pub backoff:            BackoffConfig,
    pub outbound_capacity:  usize,
    pub shutdown_grace:     Duration,
    pub max_frame_len:      usize,
}

impl TransportConfig {
    /// A quiet peer is declared dead after two missed probes.
    pub fn read_deadline(&self) -> Duration {
        self.ping_interval * 2
    }
}

/// `[collector]` after validation.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub listen:           String,
    pub ping_interval:    Duration,
    pub read_timeout:     Duration,
    pub write_timeout:    Duration,
    pub inbound_capacity: usize,
    pub max_frame_len:    usize,
}

/// What the injection check concludes when the memory query itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectionPolicy {
    /// Inconclusive is treated as clean.
    FailOpen,
    /// Inconclusive raises an alert tagged `inconclusive`.
    #[default]
    FailClosed,
}

/// Identity of this agent run, resolved once at startup and handed to every
/// component that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentContext {
    pub protected_pid: i32,
    pub agent_pid:     i32,
}

impl AgentContext {
    pub fn new(protected_pid: i32) -> Self {
        Self { protected_pid, agent_pid: std::process::id() as i32 }
    }
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid injection policy '{0}'")]
    InvalidPolicy(String),

    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("invalid [{section}] {field}: {reason}")]
    Invalid {
        section: &'static str,
        field:   &'static str,
        reason:  String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Allow `"fail_closed"` → `InjectionPolicy::FailClosed`
impl FromStr for InjectionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail_open"   => Ok(InjectionPolicy::FailOpen),
            "fail_closed" => Ok(InjectionPolicy::FailClosed),
            other         => Err(ConfigError::InvalidPolicy(other.into())),
        }
    }
}

// ───── raw TOML shapes ──────────────────────────────────────────────────────

/// Whole file as written on disk; every section may be omitted.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)] pub agent:     RawAgent,
    #[serde(default)] pub transport: RawTransport,
    #[serde(default)] pub collector: RawCollector,
    #[serde(default)] pub logging:   LoggingConfig,
    #[serde(default)] pub database:  DatabaseConfig,
    #[serde(default)] pub metrics:   MetricsConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawAgent {
    pub protected_pid:           Option<i32>,
    pub port_name:               Option<String>,
    pub receivers:               Option<usize>,
    pub workers:                 Option<usize>,
    pub queue_capacity:          Option<usize>,
    pub detector_queue_capacity: Option<usize>,
    pub injection_policy:        Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawTransport {
    pub endpoint:           Option<String>,
    pub ping_interval:      Option<String>,
    pub write_timeout:      Option<String>,
    pub ping_write_timeout: Option<String>,
    pub backoff_initial:    Option<String>,
    pub backoff_max:        Option<String>,
    pub backoff_jitter:     Option<String>,
    pub outbound_capacity:  Option<usize>,
    pub shutdown_grace:     Option<String>,
    pub max_frame_len:      Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawCollector {
    pub listen:           Option<String>,
    pub ping_interval:    Option<String>,
    pub read_timeout:     Option<String>,
    pub write_timeout:    Option<String>,
    pub inbound_capacity: Option<usize>,
}
