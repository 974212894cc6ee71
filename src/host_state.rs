//! Per-host health: a fetch-permit semaphore plus a circuit breaker.
//!
//! The breaker counts consecutive failures. Any success snaps it back to
//! Closed, which keeps the model simple and biased toward recovery.

use crate::semaphore::Semaphore;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    err_count: u32,
    last_fail: Option<Instant>,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct HostState {
    host: String,
    pub semaphore: Semaphore,
    trip_count: u32,
    reset_after: Duration,
    inner: Mutex<CircuitInner>,
}

impl HostState {
    pub fn new(host: impl Into<String>, per_host: usize, trip_count: u32, reset_after: Duration) -> Self {
        Self {
            host: host.into(),
            semaphore: Semaphore::new(per_host),
            trip_count: trip_count.max(1),
            reset_after,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                err_count: 0,
                last_fail: None,
                opened_at: None,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the scheduler may dispatch for this host right now. An Open
    /// breaker past its reset window flips to HalfOpen and admits one probe
    /// (the per-host semaphore keeps HalfOpen to a single in-flight fetch
    /// only when capacity is 1; the window check is the real gate).
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.reset_after {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a fetch outcome. Success resets the breaker unconditionally;
    /// failure increments the consecutive-error count and trips the breaker
    /// once it reaches the configured threshold.
    pub fn on_result(&self, success: bool) {
        let mut inner = self.inner.lock();
        if success {
            inner.err_count = 0;
            inner.state = CircuitState::Closed;
            return;
        }
        inner.err_count += 1;
        inner.last_fail = Some(Instant::now());
        if inner.err_count >= self.trip_count {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn inflight(&self) -> usize {
        self.semaphore.inflight()
    }
}
