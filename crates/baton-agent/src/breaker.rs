use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use baton_core::error::{BatonError, Result};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    OpenUntil(Instant),
    HalfOpen { probing: bool },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    consecutive_failures: u32,
    failure_threshold: u32,
    reset_timeout: Duration,
}

/// Consecutive-failure circuit breaker.
///
/// Opens after `failure_threshold` failures in a row, rejects calls until
/// `reset_timeout` has passed, then lets a single probe through. A probe
/// success closes the breaker; a probe failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                consecutive_failures: 0,
                failure_threshold: failure_threshold.max(1),
                reset_timeout,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask permission for one call.
    pub fn try_acquire(&self) -> Result<()> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<()> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Closed => Ok(()),
            Phase::OpenUntil(until) if now < until => Err(BatonError::CircuitOpen {
                retry_in_ms: until.duration_since(now).as_millis() as u64,
            }),
            Phase::OpenUntil(_) => {
                info!("Circuit breaker half-open, allowing probe");
                inner.phase = Phase::HalfOpen { probing: true };
                Ok(())
            }
            Phase::HalfOpen { probing: true } => Err(BatonError::CircuitOpen { retry_in_ms: 0 }),
            Phase::HalfOpen { probing: false } => {
                inner.phase = Phase::HalfOpen { probing: true };
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if !matches!(inner.phase, Phase::Closed) {
            info!("Circuit breaker closed");
        }
        inner.phase = Phase::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = matches!(inner.phase, Phase::HalfOpen { .. })
            || inner.consecutive_failures >= inner.failure_threshold;
        if trip && !matches!(inner.phase, Phase::OpenUntil(_)) {
            warn!(
                failures = inner.consecutive_failures,
                timeout_ms = inner.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
            inner.phase = Phase::OpenUntil(now + inner.reset_timeout);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    /// An open breaker whose timeout has passed reports half-open.
    pub fn state_at(&self, now: Instant) -> BreakerState {
        match self.lock().phase {
            Phase::Closed => BreakerState::Closed,
            Phase::OpenUntil(until) if now < until => BreakerState::Open,
            Phase::OpenUntil(_) | Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Apply new limits. The current phase is kept.
    pub fn reconfigure(&self, failure_threshold: u32, reset_timeout: Duration) {
        let mut inner = self.lock();
        inner.failure_threshold = failure_threshold.max(1);
        inner.reset_timeout = reset_timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_millis(1_000))
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker();
        let now = Instant::now();
        b.record_failure_at(now);
        b.record_failure_at(now);
        assert_eq!(b.state_at(now), BreakerState::Closed);
        assert!(b.try_acquire_at(now).is_ok());

        b.record_failure_at(now);
        assert_eq!(b.state_at(now), BreakerState::Open);
        let err = b.try_acquire_at(now + Duration::from_millis(400)).unwrap_err();
        match err {
            BatonError::CircuitOpen { retry_in_ms } => assert_eq!(retry_in_ms, 600),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_success_resets_count() {
        let b = breaker();
        let now = Instant::now();
        b.record_failure_at(now);
        b.record_failure_at(now);
        b.record_success();
        b.record_failure_at(now);
        assert_eq!(b.state_at(now), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[test]
    fn test_single_probe_after_timeout() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure_at(now);
        }
        let later = now + Duration::from_millis(1_001);
        assert_eq!(b.state_at(later), BreakerState::HalfOpen);
        assert!(b.try_acquire_at(later).is_ok());
        assert!(b.try_acquire_at(later).is_err());

        b.record_success();
        assert_eq!(b.state_at(later), BreakerState::Closed);
        assert!(b.try_acquire_at(later).is_ok());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure_at(now);
        }
        let later = now + Duration::from_millis(1_500);
        b.try_acquire_at(later).unwrap();
        b.record_failure_at(later);
        assert_eq!(b.state_at(later), BreakerState::Open);
        assert!(b.try_acquire_at(later + Duration::from_millis(999)).is_err());
    }

    #[test]
    fn test_reconfigure_threshold() {
        let b = breaker();
        b.reconfigure(1, Duration::from_millis(10));
        let now = Instant::now();
        b.record_failure_at(now);
        assert_eq!(b.state_at(now), BreakerState::Open);
    }
}
