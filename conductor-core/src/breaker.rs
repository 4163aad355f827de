use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub recovery_timeout: Duration,
    pub max_calls_in_half_open: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            max_calls_in_half_open: 3,
        }
    }
}

/// Process-wide circuit breaker guarding the database.
///
/// State is a handful of atomics; reads are lock-free snapshots. Times are
/// measured against a per-breaker epoch so the arithmetic stays monotonic.
pub struct CircuitBreaker {
    config: BreakerConfig,
    epoch: Instant,
    state: AtomicUsize, // 0 = Closed, 1 = Open, 2 = HalfOpen
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            state: AtomicUsize::new(0),
            failure_count: AtomicUsize::new(0),
            success_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
            name: name.into(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Whether a call may proceed. An open breaker admits nothing until
    /// `recovery_timeout` elapses, then admits a bounded number of probes.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::Relaxed);
                let waited = Duration::from_millis(self.now_millis().saturating_sub(opened_at));
                if waited >= self.config.recovery_timeout {
                    self.state.store(2, Ordering::Relaxed);
                    self.half_open_calls.store(1, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    info!(breaker = %self.name, "circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let calls = self.half_open_calls.load(Ordering::Relaxed);
                if calls < self.config.max_calls_in_half_open {
                    self.half_open_calls.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            BreakerState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.success_threshold {
                    self.state.store(0, Ordering::Relaxed);
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    self.half_open_calls.store(0, Ordering::Relaxed);
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            BreakerState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip();
                    warn!(breaker = %self.name, failures, "circuit breaker opened");
                }
            }
            BreakerState::HalfOpen => {
                // Any failure during probing re-opens immediately.
                self.trip();
                warn!(breaker = %self.name, "probe failed, circuit breaker re-opened");
            }
            BreakerState::Open => {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn trip(&self) {
        self.state.store(1, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.half_open_calls.store(0, Ordering::Relaxed);
        self.opened_at_millis
            .store(self.now_millis(), Ordering::Relaxed);
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Relaxed) {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// How long a caller should wait before retrying, while the breaker is
    /// open. Zero in any other state.
    pub fn retry_after(&self) -> Duration {
        match self.state() {
            BreakerState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::Relaxed);
                let waited = Duration::from_millis(self.now_millis().saturating_sub(opened_at));
                self.config.recovery_timeout.saturating_sub(waited)
            }
            _ => Duration::ZERO,
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                recovery_timeout: Duration::from_millis(recovery_ms),
                max_calls_in_half_open: 2,
            },
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = breaker(60_000);
        assert!(b.can_execute());
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());
        assert!(b.retry_after() > Duration::ZERO);
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = breaker(60_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        // Still under the threshold after the reset.
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_and_close() {
        let b = breaker(10);
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        // First call after the recovery timeout is the probe.
        assert!(b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.can_execute());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(10);
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.can_execute());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn half_open_bounds_concurrent_probes() {
        let b = breaker(10);
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.can_execute()); // transitions to half-open, one call admitted
        assert!(b.can_execute()); // second probe slot
        assert!(!b.can_execute()); // out of probe slots
    }
}
