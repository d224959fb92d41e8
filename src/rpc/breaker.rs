//! Per-endpoint circuit breaker (§4.2): `closed -> open -> half_open -> closed`.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    consecutive_failures: AtomicU32,
    opened_at: AtomicU64,
    /// 0 = closed, 1 = open, 2 = half_open. A half-open state only allows one
    /// probe through at a time via `half_open_probe_in_flight`.
    state: AtomicU32,
    half_open_probe_in_flight: std::sync::atomic::AtomicBool,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            state: AtomicU32::new(0),
            half_open_probe_in_flight: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            1 => {
                let elapsed = now_secs().saturating_sub(self.opened_at.load(Ordering::SeqCst));
                if elapsed >= self.reset_timeout.as_secs() {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Whether a call may proceed. In `half_open`, only a single probe call
    /// is let through at a time.
    pub fn allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                !self.half_open_probe_in_flight.swap(true, Ordering::SeqCst)
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.state.store(0, Ordering::SeqCst);
        self.half_open_probe_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.half_open_probe_in_flight.store(false, Ordering::SeqCst);
        if self.state() == CircuitState::HalfOpen {
            self.trip();
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.max_failures {
            self.trip();
        }
    }

    fn trip(&self) {
        self.state.store(1, Ordering::SeqCst);
        self.opened_at.store(now_secs(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_max_failures() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30));
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow_call());
    }

    #[test]
    fn half_open_probe_then_closed_on_success() {
        let b = CircuitBreaker::new(1, Duration::from_secs(0));
        b.record_failure();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.allow_call());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_secs(0));
        b.record_failure();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }
}
