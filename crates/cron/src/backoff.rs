//! Exponential backoff for the mirror loop.

use std::time::Duration;

/// Doubling delay between `base` and `max`, reset on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// A `max` below `base` is raised to `base`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Delay before the next attempt.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Double the delay, capped at `max`. Returns the new delay.
    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    /// Reset to `base`. Returns the new delay.
    pub fn on_success(&mut self) -> Duration {
        self.current = self.base;
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }
}
