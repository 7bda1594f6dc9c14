//! Logs every image mapped into the protected process.

use async_trait::async_trait;
use shared::event::{EventKind, NormalizedEvent};

use super::{Alert, Detector, Severity};

pub const NAME: &str = "image_load";

#[derive(Debug, Default)]
pub struct ImageLoadMonitor;

impl ImageLoadMonitor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Detector for ImageLoadMonitor {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn inspect(&mut self, ev: &NormalizedEvent) -> Option<Alert> {
        if ev.kind != EventKind::ImageLoad || !ev.targets_protected() {
            return None;
        }
        Some(Alert {
            detector: NAME,
            severity: Severity::Notice,
            pid: ev.process_id,
            caller_pid: ev.caller_pid,
            path: ev.path.clone(),
            summary: format!(
                "{} loaded at {:#x} ({} bytes) into pid {}",
                ev.image_file, ev.image_base, ev.image_size, ev.process_id
            ),
            score_delta: 0,
        })
    }
}
