use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker guarding repeated failures against one target. Opens
/// after `threshold` consecutive failures, half-opens after `reset_after`
/// to let a single trial through.
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    state: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold,
            reset_after,
            state: Mutex::new(Inner {
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Breaker tuned per kind: ssh trips fast (remote host misbehaving),
    /// http and deploy tolerate a little more.
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            "ssh" => Self::new(3, Duration::from_secs(60)),
            "http" => Self::new(5, Duration::from_secs(30)),
            _ => Self::new(5, Duration::from_secs(120)),
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.state.lock().unwrap();
        match inner.opened_at {
            None => BreakerState::Closed,
            Some(at) if at.elapsed() >= self.reset_after => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    /// Whether a call may proceed. In half-open state only one trial call is
    /// admitted until it reports an outcome.
    pub fn allow(&self) -> bool {
        let mut inner = self.state.lock().unwrap();
        match inner.opened_at {
            None => true,
            Some(at) if at.elapsed() >= self.reset_after => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;
        if inner.consecutive_failures >= self.threshold {
            // Re-arm the window on every failure past the threshold.
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_the_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_one_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow());
        // Second caller is held back while the trial is in flight.
        assert!(!breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        // opened_at was re-armed; with a zero reset window it half-opens
        // again immediately, but the failure count kept growing.
        assert!(breaker.state() != BreakerState::Closed);
    }
}
