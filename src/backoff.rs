//! Capped exponential reconnect delay.
//!
//! `delay(attempt) = min(base * 2^attempt, cap)`. The tunnel client starts
//! counting at 1 on the first stream failure and resets to 0 after every
//! successful stream open. No jitter is applied.

use std::time::Duration;

/// Reconnect delay policy for the tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before reconnect attempt number `attempt`.
    ///
    /// Saturates at the cap instead of overflowing for large attempt counts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
