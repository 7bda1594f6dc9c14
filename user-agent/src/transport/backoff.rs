//! Reconnect delay schedule.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff with additive jitter:
/// `min(initial * 2^attempt, max) + U[0, jitter)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    cfg: BackoffConfig,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg }
    }

    /// Deterministic part of the delay before retry `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.cfg
            .initial
            .checked_mul(factor)
            .map_or(self.cfg.max, |d| d.min(self.cfg.max))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = self.cfg.jitter.as_nanos() as u64;
        let extra = if jitter == 0 { 0 } else { rand::thread_rng().gen_range(0..jitter) };
        self.base_delay(attempt) + Duration::from_nanos(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backoff() -> Backoff {
        Backoff::new(BackoffConfig {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        })
    }

    #[test]
    fn doubles_then_caps() {
        let b = default_backoff();
        let expect = [500, 1000, 2000, 4000, 8000, 16000, 30000, 30000];
        for (n, ms) in expect.into_iter().enumerate() {
            assert_eq!(b.base_delay(n as u32), Duration::from_millis(ms), "attempt {n}");
        }
        assert_eq!(b.base_delay(40), Duration::from_secs(30));
        assert_eq!(b.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_range() {
        let b = default_backoff();
        for attempt in 0..12 {
            let base = b.base_delay(attempt);
            for _ in 0..200 {
                let d = b.delay_for(attempt);
                assert!(d >= base && d < base + Duration::from_millis(250), "{d:?} vs {base:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let b = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(35),
            jitter: Duration::ZERO,
        });
        assert_eq!(b.delay_for(0), Duration::from_millis(10));
        assert_eq!(b.delay_for(2), Duration::from_millis(35));
    }
}
