//! An injectable clock so election/heartbeat timing math can be driven by a
//! deterministic simulated clock in tests instead of real wall time (§8's
//! "deterministic simulated clock & network").

use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when explicitly told to, for use by the
/// simulated-cluster integration tests in `tests/cluster.rs`.
pub struct SimClock {
    inner: std::sync::Mutex<Instant>,
}

impl SimClock {
    pub fn new() -> Self {
        SimClock {
            inner: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut guard = self.inner.lock().unwrap();
        *guard += by;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        *self.inner.lock().unwrap()
    }
}
