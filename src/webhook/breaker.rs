use core::time::Duration;
use std::{
    sync::Mutex,
    time::Instant,
};

use thiserror::Error;
use tracing::{info, warn};

/// A three-state circuit breaker guarding webhook delivery.
///
/// Closed counts consecutive failures and opens at the threshold. Open
/// short-circuits every call until the recovery timeout passes, then half-open
/// admits exactly one probe: success closes the breaker, failure reopens it.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// The call was short-circuited without any I/O.
#[derive(Debug, Error)]
#[error("circuit breaker is open")]
pub struct BreakerOpen;

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Ask to make a call. `Err` means the call must be skipped.
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let mut state = self.state.lock().expect("breaker lock is never poisoned");

        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.recovery_timeout {
                    info!("Circuit breaker transitioning to half-open");
                    *state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(BreakerOpen)
                }
            }
            // A probe is already in flight.
            BreakerState::HalfOpen => Err(BreakerOpen),
        }
    }

    /// Record the outcome of a call admitted by [`Self::try_acquire`].
    pub fn record(&self, success: bool) {
        let mut state = self.state.lock().expect("breaker lock is never poisoned");

        match (*state, success) {
            (BreakerState::Closed { .. }, true) => {
                *state = BreakerState::Closed { failures: 0 };
            }
            (BreakerState::Closed { failures }, false) => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!(
                        "Circuit breaker failure threshold reached ({failures}/{}), opening",
                        self.failure_threshold
                    );
                    *state = BreakerState::Open { since: Instant::now() };
                } else {
                    *state = BreakerState::Closed { failures };
                }
            }
            (BreakerState::HalfOpen, true) => {
                info!("Circuit breaker probe succeeded, closing");
                *state = BreakerState::Closed { failures: 0 };
            }
            (BreakerState::HalfOpen, false) => {
                warn!("Circuit breaker probe failed, reopening");
                *state = BreakerState::Open { since: Instant::now() };
            }
            // A late result while open changes nothing.
            (BreakerState::Open { .. }, _) => {}
        }
    }
}
