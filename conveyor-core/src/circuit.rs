use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub cooldown: Duration,
    pub max_calls_in_half_open: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 3,
            cooldown: Duration::from_secs(60),
            max_calls_in_half_open: 5,
        }
    }
}

/// Lock-free circuit breaker wrapped around each storage backend client and
/// each webhook target host. `closed → open` after `failure_threshold`
/// consecutive failures; `open → half-open` after the cooldown; one bad
/// probe in half-open reopens, `success_threshold` good ones close.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    // Monotonic anchor so the open→half-open clock survives without locks.
    started: Instant,
    state: AtomicUsize, // 0 = Closed, 1 = Open, 2 = HalfOpen
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    last_failure_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            state: AtomicUsize::new(0),
            failure_count: AtomicUsize::new(0),
            success_count: AtomicUsize::new(0),
            last_failure_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
            name: name.into(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_failure = self.last_failure_millis.load(Ordering::Relaxed);
                let now = self.now_millis();

                if now.saturating_sub(last_failure) >= self.config.cooldown.as_millis() as u64 {
                    self.state.store(2, Ordering::Relaxed);
                    self.half_open_calls.store(0, Ordering::Relaxed);
                    info!(
                        "circuit breaker '{}' transitioning from open to half-open",
                        self.name
                    );
                    metrics::counter!("circuit_breaker_half_open_total", "name" => self.name.clone())
                        .increment(1);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let current_calls = self.half_open_calls.load(Ordering::Relaxed);
                if current_calls < self.config.max_calls_in_half_open {
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
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                let success_count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;

                if success_count >= self.config.success_threshold {
                    self.state.store(0, Ordering::Relaxed);
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    self.half_open_calls.store(0, Ordering::Relaxed);
                    info!(
                        "circuit breaker '{}' transitioning from half-open to closed",
                        self.name
                    );
                }
            }
            CircuitState::Open => {
                // Ignore successes in the open state.
            }
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failure_count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;

                if failure_count >= self.config.failure_threshold {
                    self.state.store(1, Ordering::Relaxed);
                    self.last_failure_millis
                        .store(self.now_millis(), Ordering::Relaxed);
                    warn!(
                        "circuit breaker '{}' transitioning from closed to open after {} failures",
                        self.name, failure_count
                    );
                    metrics::counter!("circuit_breaker_open_total", "name" => self.name.clone())
                        .increment(1);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open immediately goes back to open.
                self.state.store(1, Ordering::Relaxed);
                self.failure_count.fetch_add(1, Ordering::Relaxed);
                self.success_count.store(0, Ordering::Relaxed);
                self.half_open_calls.store(0, Ordering::Relaxed);
                self.last_failure_millis
                    .store(self.now_millis(), Ordering::Relaxed);
                warn!(
                    "circuit breaker '{}' transitioning from half-open to open due to failure",
                    self.name
                );
            }
            CircuitState::Open => {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Relaxed) {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: usize, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 2,
                cooldown,
                max_calls_in_half_open: 3,
            },
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(60));
        assert!(breaker.can_execute());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_successes() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Zero cooldown: the next gate check moves to half-open.
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_bounds_probe_calls() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.record_failure();

        assert!(breaker.can_execute()); // transitions to half-open, call 1
        assert!(breaker.can_execute()); // call 2
        assert!(breaker.can_execute()); // call 3
        assert!(!breaker.can_execute()); // over max_calls_in_half_open
    }
}
