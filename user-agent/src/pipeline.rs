//! Where ingestion hands events off: the detector bus and the collector link.

use std::sync::Arc;

use log::Level;
use metrics::counter;
use shared::event::NormalizedEvent;
use tokio_util::sync::CancellationToken;

use crate::{
    comms::EventSink,
    detect::DetectorBus,
    telemetry,
    transport::{TransportError, TransportHandle},
    warden_log,
};

/// Fans every event out to the detectors (never blocks) and to the
/// collector queue (blocks the worker while that queue is full, until
/// `stop` fires).
pub struct ForwardingSink {
    bus: DetectorBus,
    link: Option<TransportHandle>,
    stop: CancellationToken,
}

impl ForwardingSink {
    pub fn new(bus: DetectorBus, link: Option<TransportHandle>, stop: CancellationToken) -> Self {
        Self { bus, link, stop }
    }
}

impl EventSink for ForwardingSink {
    fn publish(&self, ev: Arc<NormalizedEvent>) {
        self.bus.publish(&ev);
        let Some(link) = &self.link else {
            return;
        };
        match link.send_event_blocking(&ev, &self.stop) {
            Ok(()) => counter!(telemetry::EVENTS_FORWARDED).increment(1),
            Err(TransportError::Cancelled) => {
                counter!(telemetry::FRAMES_DROPPED, "reason" => "forward_cancelled").increment(1);
                warden_log!(Level::Debug, "transport", "outbound queue full on shutdown, {} event dropped", ev.kind)
            }
            Err(TransportError::Closed) => {
                warden_log!(Level::Debug, "transport", "link closed, {} event not forwarded", ev.kind)
            }
            Err(e) => warden_log!(Level::Warn, "transport", "cannot forward {} event: {}", ev.kind, e),
        }
    }
}
