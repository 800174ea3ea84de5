//! Fast-fail protection for the IdP connection.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::error::{ErrorKind, Result};

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Opens after a run of consecutive failures and fails callers fast until a cool-down
/// elapses, after which a single trial request is admitted.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Checks admission. Returns `CircuitOpen` while the circuit is open or while the
    /// post-cool-down trial request is still in flight.
    pub(crate) fn check(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(open_until) = state.open_until else {
            return Ok(());
        };
        if Instant::now() < open_until || state.trial_in_flight {
            return Err(ErrorKind::CircuitOpen.into());
        }
        state.trial_in_flight = true;
        Ok(())
    }

    pub(crate) fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        *state = BreakerState::default();
    }

    pub(crate) fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.trial_in_flight = false;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
        }
    }
}
