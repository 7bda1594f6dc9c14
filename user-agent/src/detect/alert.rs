//! Alerts and where they go.

use std::fmt;

use log::Level;
use metrics::counter;
use tokio::sync::mpsc;

use crate::{db::LedgerEntry, telemetry, warden_log};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Noteworthy activity, not an attack on its own.
    Notice,
    Suspicious,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Notice => "notice",
            Severity::Suspicious => "suspicious",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub detector: &'static str,
    pub severity: Severity,
    pub pid: i32,
    pub caller_pid: i32,
    /// Executable of the caller, when enrichment found it.
    pub path: String,
    pub summary: String,
    /// Score added to `path` in the ledger.
    pub score_delta: i64,
}

/// Fan-in point for every detector: logs, counts, and forwards scored
/// alerts to the ledger writer.
#[derive(Clone, Default)]
pub struct AlertSink {
    ledger: Option<mpsc::Sender<LedgerEntry>>,
    tap: Option<mpsc::UnboundedSender<Alert>>,
}

impl AlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(mut self, tx: mpsc::Sender<LedgerEntry>) -> Self {
        self.ledger = Some(tx);
        self
    }

    /// Mirror every alert into `tx` (response hooks, tests).
    pub fn with_tap(mut self, tx: mpsc::UnboundedSender<Alert>) -> Self {
        self.tap = Some(tx);
        self
    }

    pub fn emit(&self, alert: Alert) {
        counter!(telemetry::ALERTS, "detector" => alert.detector).increment(1);
        match alert.severity {
            Severity::Notice => warden_log!(
                Level::Info,
                "detect",
                "[NOTICE:{}] {}",
                alert.detector,
                alert.summary
            ),
            _ => warden_log!(
                Level::Warn,
                "detect",
                "[ALERT:{}] {} severity={} path={:?}",
                alert.detector,
                alert.summary,
                alert.severity,
                alert.path
            ),
        }

        if let Some(ledger) = &self.ledger {
            if alert.score_delta != 0 && !alert.path.is_empty() {
                let entry = LedgerEntry {
                    path: alert.path.clone(),
                    kind: alert.detector.to_string(),
                    info: alert.summary.clone(),
                    delta: alert.score_delta,
                };
                if ledger.try_send(entry).is_err() {
                    warden_log!(Level::Warn, "detect", "ledger queue full, score for {:?} lost", alert.path);
                }
            }
        }

        if let Some(tap) = &self.tap {
            let _ = tap.send(alert);
        }
    }
}
