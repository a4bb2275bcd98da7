use std::time::Duration;

/// Retry policy for a writer that finds the oldest buffer still borrowed.
///
/// Default values suit frame rates in the tens of Hz:
/// - 100µs base delay, doubling per consecutive failed claim
/// - Delay capped at 2ms, so a returning buffer is picked up quickly
/// - 500 consecutive failures (roughly one second) count as starvation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimBackoff {
    /// Delay after the first failed claim (doubles each further attempt)
    pub base_delay: Duration,
    /// Maximum delay cap (backoff won't exceed this)
    pub max_delay: Duration,
    /// Consecutive failed claims after which readers are considered to be
    /// starving the writer
    pub starvation_threshold: u32,
}

impl Default for ClaimBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_micros(100),
            max_delay: Duration::from_millis(2),
            starvation_threshold: 500,
        }
    }
}

impl ClaimBackoff {
    /// Delay before retrying after `attempt` consecutive failures (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// True exactly once per starvation episode, when `failures` reaches the
    /// threshold.
    pub fn starvation_reached(&self, failures: u32) -> bool {
        failures == self.starvation_threshold
    }
}
