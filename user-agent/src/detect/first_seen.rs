//! Handle guard: remembers which binaries have touched the protected process.
//!
//! A sighting is the `(path, hash)` of the caller behind an object operation
//! on the protected process. The first sighting of a pair raises a notice and
//! a small score; repeats are silent. The set is unbounded and lives for the
//! whole run.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use log::Level;
use shared::event::{EventKind, NormalizedEvent};

use super::{Alert, Detector, Severity};
use crate::warden_log;

pub const NAME: &str = "first_seen";
const SCORE: i64 = 5;

/// Shared so a collector can inspect what has been seen so far.
pub type SeenSet = Arc<RwLock<HashSet<(String, String)>>>;

#[derive(Default)]
pub struct FirstSeenDetector {
    seen: SeenSet,
}

impl FirstSeenDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(seen: SeenSet) -> Self {
        Self { seen }
    }

    pub fn seen(&self) -> SeenSet {
        Arc::clone(&self.seen)
    }

    /// Record `(path, hash)`; true on first sighting.
    fn record(&self, path: &str, hash: &str) -> bool {
        let key = (path.to_owned(), hash.to_owned());
        {
            let Ok(read) = self.seen.read() else {
                warden_log!(Level::Error, "detect", "first_seen set poisoned");
                return false;
            };
            if read.contains(&key) {
                return false;
            }
        }
        match self.seen.write() {
            // another holder may have inserted between the two locks
            Ok(mut write) => write.insert(key),
            Err(_) => {
                warden_log!(Level::Error, "detect", "first_seen set poisoned");
                false
            }
        }
    }
}

#[async_trait]
impl Detector for FirstSeenDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn inspect(&mut self, ev: &NormalizedEvent) -> Option<Alert> {
        if ev.kind != EventKind::ObjectOp || !ev.targets_protected() {
            return None;
        }
        if ev.path.is_empty() || ev.path_hash.is_empty() {
            return None;
        }
        if !self.record(&ev.path, &ev.path_hash) {
            return None;
        }
        Some(Alert {
            detector: NAME,
            severity: Severity::Notice,
            pid: ev.process_id,
            caller_pid: ev.caller_pid,
            path: ev.path.clone(),
            summary: format!(
                "first handle operation {} on pid {} from {} ({})",
                ev.operation, ev.process_id, ev.path, ev.path_hash
            ),
            score_delta: SCORE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_op(path: &str, hash: &str) -> NormalizedEvent {
        let mut ev = NormalizedEvent::new(EventKind::ObjectOp);
        ev.process_id = 100;
        ev.caller_pid = 555;
        ev.to_protected_pid = 100;
        ev.operation = 1;
        ev.path = path.into();
        ev.path_hash = hash.into();
        ev
    }

    #[tokio::test]
    async fn each_pair_is_reported_once() {
        let mut det = FirstSeenDetector::new();
        let ev = handle_op(r"C:\tools\probe.exe", "aa");
        assert!(det.inspect(&ev).await.is_some());
        for _ in 0..5 {
            assert!(det.inspect(&ev).await.is_none());
        }
        // same path, new content
        assert!(det.inspect(&handle_op(r"C:\tools\probe.exe", "bb")).await.is_some());
        assert_eq!(det.seen().read().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn needs_both_path_and_hash() {
        let mut det = FirstSeenDetector::new();
        assert!(det.inspect(&handle_op("", "aa")).await.is_none());
        assert!(det.inspect(&handle_op(r"C:\x.exe", "")).await.is_none());

        let mut elsewhere = handle_op(r"C:\x.exe", "aa");
        elsewhere.process_id = 9;
        assert!(det.inspect(&elsewhere).await.is_none());
        assert!(det.seen().read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn detectors_sharing_a_set_dedup_together() {
        let set = SeenSet::default();
        let mut a = FirstSeenDetector::with_set(set.clone());
        let mut b = FirstSeenDetector::with_set(set.clone());
        let ev = handle_op(r"C:\x.exe", "aa");
        assert!(a.inspect(&ev).await.is_some());
        assert!(b.inspect(&ev).await.is_none());
    }
}
