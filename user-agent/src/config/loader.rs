// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads `warden.toml`, deserializes the raw sections, fills defaults,
//! parses humantime durations and validates the result into a [`Config`].

use crate::config::model::*;
use crate::warden_log;
use log::Level;
use shared::constants::*;
use std::{fs, path::Path, time::Duration};

/// Load and validate the configuration at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    warden_log!(Level::Debug, "config", "Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = from_toml_str(&txt)?;
    warden_log!(Level::Info, "config", "Loaded config from {:?}", path);
    Ok(cfg)
}

/// Parse and validate configuration text. Missing keys take their defaults.
pub fn from_toml_str(txt: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(txt)?;
    let cfg = Config {
        agent:     convert_agent(raw.agent)?,
        transport: convert_transport(raw.transport)?,
        collector: convert_collector(raw.collector)?,
        logging:   raw.logging,
        database:  raw.database,
        metrics:   raw.metrics,
    };
    validate(&cfg)?;
    Ok(cfg)
}

/// Positional overrides from the agent command line:
/// `warden-agent [config] [protected_pid] [endpoint]`.
pub fn apply_overrides(
    cfg: &mut Config,
    protected_pid: Option<&str>,
    endpoint: Option<&str>,
) -> Result<(), ConfigError> {
    if let Some(pid) = protected_pid {
        cfg.agent.protected_pid = pid.trim().parse().map_err(|_| ConfigError::Invalid {
            section: "agent",
            field:   "protected_pid",
            reason:  format!("'{pid}' is not a process id"),
        })?;
    }
    if let Some(ep) = endpoint {
        cfg.transport.endpoint = ep.trim().to_string();
    }
    validate(cfg)
}

fn parse_duration(raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match raw {
        None => Ok(default),
        Some(s) => humantime::parse_duration(s.trim())
            .map_err(|e| ConfigError::InvalidDuration(s, e)),
    }
}

fn convert_agent(raw: RawAgent) -> Result<AgentConfig, ConfigError> {
    let injection_policy = match raw.injection_policy {
        Some(p) => p.parse()?,
        None    => InjectionPolicy::default(),
    };
    Ok(AgentConfig {
        protected_pid:           raw.protected_pid.unwrap_or(0),
        port_name:               raw.port_name.unwrap_or_else(|| DEFAULT_PORT_NAME.into()),
        receivers:               raw.receivers.unwrap_or(DEFAULT_RECEIVERS),
        workers:                 raw.workers.unwrap_or(DEFAULT_WORKERS),
        queue_capacity:          raw.queue_capacity.unwrap_or(DEFAULT_JOB_QUEUE_CAPACITY),
        detector_queue_capacity: raw.detector_queue_capacity.unwrap_or(DEFAULT_DETECTOR_QUEUE_CAPACITY),
        injection_policy,
    })
}

fn convert_transport(raw: RawTransport) -> Result<TransportConfig, ConfigError> {
    Ok(TransportConfig {
        endpoint:           raw.endpoint.unwrap_or_default(),
        ping_interval:      parse_duration(raw.ping_interval, DEFAULT_AGENT_PING_INTERVAL)?,
        write_timeout:      parse_duration(raw.write_timeout, Duration::from_secs(15))?,
        ping_write_timeout: parse_duration(raw.ping_write_timeout, Duration::from_secs(5))?,
        backoff: BackoffConfig {
            initial: parse_duration(raw.backoff_initial, DEFAULT_BACKOFF_INITIAL)?,
            max:     parse_duration(raw.backoff_max, DEFAULT_BACKOFF_MAX)?,
            jitter:  parse_duration(raw.backoff_jitter, DEFAULT_BACKOFF_JITTER)?,
        },
        outbound_capacity:  raw.outbound_capacity.unwrap_or(DEFAULT_OUTBOUND_CAPACITY),
        shutdown_grace:     parse_duration(raw.shutdown_grace, Duration::from_secs(5))?,
        max_frame_len:      raw.max_frame_len.unwrap_or(MAX_FRAME_LEN),
    })
}

fn convert_collector(raw: RawCollector) -> Result<CollectorConfig, ConfigError> {
    Ok(CollectorConfig {
        listen:           raw.listen.unwrap_or_else(|| "0.0.0.0:8080".into()),
        ping_interval:    parse_duration(raw.ping_interval, DEFAULT_COLLECTOR_PING_INTERVAL)?,
        read_timeout:     parse_duration(raw.read_timeout, Duration::from_secs(60))?,
        write_timeout:    parse_duration(raw.write_timeout, Duration::from_secs(10))?,
        inbound_capacity: raw.inbound_capacity.unwrap_or(1024),
        max_frame_len:    MAX_FRAME_LEN,
    })
}

fn invalid(section: &'static str, field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { section, field, reason: reason.into() }
}

/// Reject values the pipeline cannot run with.
///
/// `protected_pid` and `endpoint` may still be zero/empty here: they are
/// only required by the agent binary, which checks them via
/// [`require_agent_identity`] after command-line overrides.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let a = &cfg.agent;
    if a.protected_pid < 0 {
        return Err(invalid("agent", "protected_pid", "must not be negative"));
    }
    for (field, v) in [
        ("receivers", a.receivers),
        ("workers", a.workers),
        ("queue_capacity", a.queue_capacity),
        ("detector_queue_capacity", a.detector_queue_capacity),
    ] {
        if v == 0 {
            return Err(invalid("agent", field, "must be greater than zero"));
        }
    }

    let t = &cfg.transport;
    if t.outbound_capacity == 0 {
        return Err(invalid("transport", "outbound_capacity", "must be greater than zero"));
    }
    if t.ping_interval.is_zero() {
        return Err(invalid("transport", "ping_interval", "must be greater than zero"));
    }
    if t.backoff.initial.is_zero() || t.backoff.initial > t.backoff.max {
        return Err(invalid("transport", "backoff_initial", "must be in (0, backoff_max]"));
    }
    if t.max_frame_len == 0 {
        return Err(invalid("transport", "max_frame_len", "must be greater than zero"));
    }

    let c = &cfg.collector;
    if c.inbound_capacity == 0 {
        return Err(invalid("collector", "inbound_capacity", "must be greater than zero"));
    }
    if c.ping_interval.is_zero() || c.read_timeout.is_zero() {
        return Err(invalid("collector", "ping_interval", "probe and read timeout must be non-zero"));
    }
    Ok(())
}

/// The agent cannot start without a process to protect and a collector.
pub fn require_agent_identity(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.agent.protected_pid <= 0 {
        return Err(invalid("agent", "protected_pid", "must be a positive process id"));
    }
    if cfg.transport.endpoint.is_empty() {
        return Err(invalid("transport", "endpoint", "collector address is required"));
    }
    Ok(())
}
