//! Exponential backoff.

use std::time::Duration;

/// Doubling delay from a base up to a cap; resets on success.
///
/// Used by subscribers reconnecting to the hub and by background retries of
/// transient store failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    /// Default first delay.
    pub const DEFAULT_BASE: Duration = Duration::from_millis(100);

    /// Default cap.
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30);

    /// Creates a backoff starting at `base`, capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts.min(31)).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Returns to the base delay.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }
}
