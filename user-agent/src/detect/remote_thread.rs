//! Threads created inside the protected process by someone else.

use async_trait::async_trait;
use shared::event::{EventKind, NormalizedEvent};

use super::{Alert, Detector, Severity};

pub const NAME: &str = "remote_thread";
const SCORE: i64 = 50;

#[derive(Debug, Default)]
pub struct RemoteThreadDetector;

impl RemoteThreadDetector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Detector for RemoteThreadDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn inspect(&mut self, ev: &NormalizedEvent) -> Option<Alert> {
        if ev.kind != EventKind::ThreadCreate || !ev.targets_protected() || ev.caller_pid == ev.process_id {
            return None;
        }
        Some(Alert {
            detector: NAME,
            severity: Severity::Critical,
            pid: ev.process_id,
            caller_pid: ev.caller_pid,
            path: ev.path.clone(),
            summary: format!(
                "remote thread {} created in pid {} by pid {}",
                ev.thread_id, ev.process_id, ev.caller_pid
            ),
            score_delta: SCORE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(process_id: i32, caller_pid: i32, protected: i32) -> NormalizedEvent {
        let mut ev = NormalizedEvent::new(EventKind::ThreadCreate);
        ev.process_id = process_id;
        ev.thread_id = 4321;
        ev.caller_pid = caller_pid;
        ev.to_protected_pid = protected;
        ev
    }

    #[tokio::test]
    async fn foreign_creator_in_protected_process_alerts() {
        let mut det = RemoteThreadDetector::new();
        let alert = det.inspect(&thread(100, 200, 100)).await.expect("alert");
        assert_eq!(alert.detector, NAME);
        assert_eq!(alert.pid, 100);
        assert_eq!(alert.caller_pid, 200);
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn own_threads_and_other_processes_are_ignored() {
        let mut det = RemoteThreadDetector::new();
        assert!(det.inspect(&thread(100, 100, 100)).await.is_none());
        assert!(det.inspect(&thread(300, 200, 100)).await.is_none());
        // no protected pid configured
        assert!(det.inspect(&thread(100, 200, 0)).await.is_none());

        let mut other = thread(100, 200, 100);
        other.kind = EventKind::ObjectOp;
        assert!(det.inspect(&other).await.is_none());
    }
}
