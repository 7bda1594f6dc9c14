// src/telemetry.rs
//! Metric names and the optional Prometheus scrape endpoint.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::config::MetricsConfig;

pub const FRAMES_RECEIVED: &str = "warden_frames_received_total";
/// Labelled with `reason`.
pub const FRAMES_DROPPED: &str = "warden_frames_dropped_total";
pub const EVENTS_FORWARDED: &str = "warden_events_forwarded_total";
pub const DETECTOR_BACKLOG_DROPPED: &str = "warden_detector_backlog_dropped_total";
/// Labelled with `detector`.
pub const ALERTS: &str = "warden_alerts_total";
pub const TRANSPORT_RECONNECTS: &str = "warden_transport_reconnects_total";
pub const COLLECTOR_AGENTS: &str = "warden_collector_agents";
pub const LEDGER_FLUSH_SECONDS: &str = "warden_ledger_flush_seconds";

fn describe() {
    describe_counter!(FRAMES_RECEIVED, "Raw frames read off the kernel port or an agent link");
    describe_counter!(FRAMES_DROPPED, "Frames discarded before normalization");
    describe_counter!(EVENTS_FORWARDED, "Normalized events handed to the collector link");
    describe_counter!(DETECTOR_BACKLOG_DROPPED, "Events a full detector queue could not accept");
    describe_counter!(ALERTS, "Alerts raised per detector");
    describe_counter!(TRANSPORT_RECONNECTS, "Failed or lost collector connections");
    describe_gauge!(COLLECTOR_AGENTS, "Agents currently connected to the collector");
    describe_histogram!(LEDGER_FLUSH_SECONDS, "Duration of one batched ledger write");
}

/// Start the scrape listener when `[metrics].listen` is set.
/// Must be called from inside a Tokio runtime.
pub fn install(cfg: &MetricsConfig) -> Result<(), BuildError> {
    let Some(addr) = cfg.listen else {
        return Ok(());
    };
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    log::info!("metrics exporter listening on {addr}");
    Ok(())
}
