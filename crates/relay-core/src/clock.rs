//! Steady-time reference for renewals, timeouts, and backoff.
//!
//! Never persisted, never compared across processes. The database's `now()`
//! is the authority for anything that ends up in a row (lease expiry,
//! `createdAt`, ...); this clock only paces *this* process's scheduling
//! decisions.

use std::time::Instant;

/// Contract: `now()` returns a non-decreasing elapsed-seconds reading since
/// some fixed epoch within the process. Implementations must not be
/// affected by wall-clock adjustments (NTP step, DST, manual clock set).
pub trait MonotonicClock: Send + Sync {
    fn now_seconds(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct SystemMonotonicClock {
    epoch: Instant,
}

impl SystemMonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemMonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemMonotonicClock {
    fn now_seconds(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}
