//! Detector abstraction and the bus that feeds them.
//! -----------------------------------------------------------------------------
//! Every detector owns a bounded queue and a task. The bus publishes each
//! event into every queue with `try_send`: a detector that falls behind loses
//! events from its own queue only and never stalls ingestion or its peers.
//!
//! A detector task is `Running` while its queue is open and `Stopped` once the
//! bus is dropped (or the process is cancelled). Irrelevant or malformed events
//! are skipped; a detector never errors out of its loop.

pub mod alert;
pub mod dll_injection;
pub mod first_seen;
pub mod image_load;
pub mod remote_thread;

use std::sync::Arc;

use async_trait::async_trait;
use log::Level;
use metrics::counter;
use shared::event::NormalizedEvent;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{telemetry, warden_log};
pub use alert::{Alert, AlertSink, Severity};
pub use dll_injection::DllInjectionDetector;
pub use first_seen::{FirstSeenDetector, SeenSet};
pub use image_load::ImageLoadMonitor;
pub use remote_thread::RemoteThreadDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Running,
    Stopped,
}

#[async_trait]
pub trait Detector: Send + 'static {
    /// Display name for logs, metrics and the ledger.
    fn name(&self) -> &'static str;

    /// Look at one event; `None` when nothing is worth reporting.
    async fn inspect(&mut self, ev: &NormalizedEvent) -> Option<Alert>;
}

struct Route {
    name: &'static str,
    tx: mpsc::Sender<Arc<NormalizedEvent>>,
}

/// Send side of every detector queue.
#[derive(Clone)]
pub struct DetectorBus {
    routes: Arc<Vec<Route>>,
}

impl DetectorBus {
    /// Offer `ev` to every detector without waiting on any of them.
    pub fn publish(&self, ev: &Arc<NormalizedEvent>) {
        for route in self.routes.iter() {
            match route.tx.try_send(Arc::clone(ev)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    counter!(telemetry::DETECTOR_BACKLOG_DROPPED, "detector" => route.name).increment(1);
                    warden_log!(
                        Level::Warn,
                        "detect",
                        "{} backlog full, {} event dropped for it",
                        route.name,
                        ev.kind
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn detectors(&self) -> Vec<&'static str> {
        self.routes.iter().map(|r| r.name).collect()
    }
}

/// Spawn one task per detector on the current runtime.
pub fn spawn_detectors(
    detectors: Vec<Box<dyn Detector>>,
    queue_capacity: usize,
    sink: AlertSink,
    cancel: CancellationToken,
) -> (DetectorBus, Vec<JoinHandle<DetectorState>>) {
    let mut routes = Vec::with_capacity(detectors.len());
    let mut handles = Vec::with_capacity(detectors.len());

    for det in detectors {
        let (tx, rx) = mpsc::channel(queue_capacity);
        routes.push(Route { name: det.name(), tx });
        handles.push(tokio::spawn(run_detector(det, rx, sink.clone(), cancel.clone())));
    }
    (DetectorBus { routes: Arc::new(routes) }, handles)
}

async fn run_detector(
    mut det: Box<dyn Detector>,
    mut rx: mpsc::Receiver<Arc<NormalizedEvent>>,
    sink: AlertSink,
    cancel: CancellationToken,
) -> DetectorState {
    let name = det.name();
    warden_log!(Level::Info, "detect", "detector '{}' running", name);
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(ev) => {
                    if let Some(alert) = det.inspect(&ev).await {
                        sink.emit(alert);
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    warden_log!(Level::Info, "detect", "detector '{}' stopped", name);
    DetectorState::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::event::EventKind;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Alerts on every event, optionally parked until released.
    struct Echo {
        name: &'static str,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Detector for Echo {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn inspect(&mut self, ev: &NormalizedEvent) -> Option<Alert> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Some(Alert {
                detector: self.name,
                severity: Severity::Notice,
                pid: ev.process_id,
                caller_pid: ev.caller_pid,
                path: String::new(),
                summary: String::new(),
                score_delta: 0,
            })
        }
    }

    fn event(pid: i32) -> Arc<NormalizedEvent> {
        let mut ev = NormalizedEvent::new(EventKind::ThreadCreate);
        ev.process_id = pid;
        Arc::new(ev)
    }

    #[tokio::test]
    async fn a_stuck_detector_does_not_starve_the_others() {
        let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let (bus, handles) = spawn_detectors(
            vec![
                Box::new(Echo { name: "stuck", gate: Some(gate.clone()) }),
                Box::new(Echo { name: "fast", gate: None }),
            ],
            2,
            AlertSink::new().with_tap(tap_tx),
            CancellationToken::new(),
        );
        assert_eq!(bus.detectors(), vec!["stuck", "fast"]);

        for pid in 1..=10 {
            bus.publish(&event(pid));
            tokio::task::yield_now().await;
        }

        let mut fast = Vec::new();
        while let Ok(Some(a)) = tokio::time::timeout(Duration::from_millis(200), tap_rx.recv()).await {
            assert_eq!(a.detector, "fast");
            fast.push(a.pid);
        }
        assert_eq!(fast, (1..=10).collect::<Vec<_>>());

        drop(bus);
        let mut stuck = 0;
        loop {
            gate.notify_one();
            match tokio::time::timeout(Duration::from_secs(1), tap_rx.recv()).await.unwrap() {
                Some(a) => {
                    assert_eq!(a.detector, "stuck");
                    stuck += 1;
                }
                None => break,
            }
        }
        // at most one in flight plus a full queue of two
        assert!((2..=3).contains(&stuck), "stuck saw {stuck}");
        for h in handles {
            assert_eq!(h.await.unwrap(), DetectorState::Stopped);
        }
    }

    #[tokio::test]
    async fn cancellation_stops_detectors() {
        let cancel = CancellationToken::new();
        let (_bus, handles) = spawn_detectors(
            vec![Box::new(Echo { name: "idle", gate: None })],
            4,
            AlertSink::new(),
            cancel.clone(),
        );
        cancel.cancel();
        for h in handles {
            assert_eq!(h.await.unwrap(), DetectorState::Stopped);
        }
    }
}
