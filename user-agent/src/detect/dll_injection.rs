//! Image loads whose base is not backed by a mapped image.
//!
//! The region query runs on the blocking pool. When it fails the configured
//! [`InjectionPolicy`] decides: fail-open stays quiet, fail-closed raises a
//! lower-scored alert tagged `inconclusive`.

use std::sync::Arc;

use async_trait::async_trait;
use log::Level;
use shared::event::{EventKind, NormalizedEvent};

use super::{Alert, Detector, Severity};
use crate::{
    config::InjectionPolicy,
    introspect::{IntrospectError, ProcessIntrospector, RegionKind},
    warden_log,
};

pub const NAME: &str = "dll_injection";
const SCORE: i64 = 80;
const INCONCLUSIVE_SCORE: i64 = 20;
/// The System process; kernel-mode images load into it.
const SYSTEM_PID: i32 = 4;

pub struct DllInjectionDetector {
    introspector: Arc<dyn ProcessIntrospector>,
    policy: InjectionPolicy,
}

impl DllInjectionDetector {
    pub fn new(introspector: Arc<dyn ProcessIntrospector>, policy: InjectionPolicy) -> Self {
        Self { introspector, policy }
    }

    async fn query(&self, pid: i32, base: u64) -> Result<RegionKind, IntrospectError> {
        let introspector = Arc::clone(&self.introspector);
        tokio::task::spawn_blocking(move || introspector.region_kind(pid, base))
            .await
            .unwrap_or(Err(IntrospectError::Unsupported))
    }
}

#[async_trait]
impl Detector for DllInjectionDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn inspect(&mut self, ev: &NormalizedEvent) -> Option<Alert> {
        if ev.kind != EventKind::ImageLoad || ev.image_base == 0 {
            return None;
        }
        // driver loads and the System process cannot be queried from user mode
        if ev.process_id <= 0 || ev.process_id == SYSTEM_PID {
            return None;
        }
        let (severity, summary, delta) = match self.query(ev.process_id, ev.image_base).await {
            Ok(RegionKind::Image) => return None,
            Ok(region) => (
                Severity::Critical,
                format!(
                    "{} at {:#x} in pid {} is backed by {:?} memory",
                    ev.image_file, ev.image_base, ev.process_id, region
                ),
                SCORE,
            ),
            Err(e) => match self.policy {
                InjectionPolicy::FailOpen => {
                    warden_log!(Level::Debug, "detect", "region query pid {}: {}", ev.process_id, e);
                    return None;
                }
                InjectionPolicy::FailClosed => (
                    Severity::Suspicious,
                    format!(
                        "inconclusive: {} at {:#x} in pid {} ({})",
                        ev.image_file, ev.image_base, ev.process_id, e
                    ),
                    INCONCLUSIVE_SCORE,
                ),
            },
        };
        Some(Alert {
            detector: NAME,
            severity,
            pid: ev.process_id,
            caller_pid: ev.caller_pid,
            path: ev.path.clone(),
            summary,
            score_delta: delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{path::PathBuf, time::SystemTime};

    struct Region(Option<RegionKind>);

    impl ProcessIntrospector for Region {
        fn executable_path(&self, pid: i32) -> Result<PathBuf, IntrospectError> {
            Err(IntrospectError::NoSuchProcess(pid))
        }
        fn start_time(&self, pid: i32) -> Result<SystemTime, IntrospectError> {
            Err(IntrospectError::NoSuchProcess(pid))
        }
        fn region_kind(&self, pid: i32, _: u64) -> Result<RegionKind, IntrospectError> {
            self.0.ok_or(IntrospectError::AccessDenied(pid))
        }
    }

    fn load(base: u64) -> NormalizedEvent {
        let mut ev = NormalizedEvent::new(EventKind::ImageLoad);
        ev.process_id = 100;
        ev.caller_pid = 100;
        ev.image_file = r"C:\Users\x\evil.dll".into();
        ev.image_base = base;
        ev.image_size = 0x2000;
        ev.path = r"C:\game\game.exe".into();
        ev
    }

    fn detector(region: Option<RegionKind>, policy: InjectionPolicy) -> DllInjectionDetector {
        DllInjectionDetector::new(Arc::new(Region(region)), policy)
    }

    #[tokio::test]
    async fn image_backed_loads_are_clean() {
        let mut det = detector(Some(RegionKind::Image), InjectionPolicy::FailClosed);
        assert!(det.inspect(&load(0x1000_0000)).await.is_none());
    }

    #[tokio::test]
    async fn private_or_mapped_base_alerts() {
        for region in [RegionKind::Private, RegionKind::Mapped, RegionKind::Free] {
            let mut det = detector(Some(region), InjectionPolicy::FailOpen);
            let alert = det.inspect(&load(0x1000_0000)).await.expect("alert");
            assert_eq!(alert.severity, Severity::Critical);
            assert_eq!(alert.score_delta, SCORE);
            assert!(alert.summary.contains("evil.dll"));
        }
    }

    #[tokio::test]
    async fn query_failure_follows_policy() {
        let mut open = detector(None, InjectionPolicy::FailOpen);
        assert!(open.inspect(&load(0x1000_0000)).await.is_none());

        let mut closed = detector(None, InjectionPolicy::FailClosed);
        let alert = closed.inspect(&load(0x1000_0000)).await.expect("inconclusive alert");
        assert_eq!(alert.severity, Severity::Suspicious);
        assert_eq!(alert.score_delta, INCONCLUSIVE_SCORE);
        assert!(alert.summary.starts_with("inconclusive"));
    }

    #[tokio::test]
    async fn zero_base_and_other_kinds_are_skipped() {
        let mut det = detector(Some(RegionKind::Private), InjectionPolicy::FailClosed);
        assert!(det.inspect(&load(0)).await.is_none());
        let mut ev = load(0x1000);
        ev.kind = EventKind::ThreadCreate;
        assert!(det.inspect(&ev).await.is_none());
    }

    #[tokio::test]
    async fn kernel_and_system_loads_raise_nothing() {
        // fail-closed would otherwise report every unqueryable load
        let mut det = detector(None, InjectionPolicy::FailClosed);
        for pid in [0, -1, SYSTEM_PID] {
            let mut ev = load(0xFFFF_F800_0000_0000);
            ev.process_id = pid;
            ev.caller_pid = pid;
            assert!(det.inspect(&ev).await.is_none(), "pid {pid}");
        }
        assert!(det.inspect(&load(0x1000_0000)).await.is_some());
    }
}
