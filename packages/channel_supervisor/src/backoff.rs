use std::time::Duration;

/// Reconnect delay policy shared by every channel.
///
/// The delay before reconnect attempt `n` (counting from zero) is
/// `min(base_delay * multiplier^n, cap_delay)`. Once `max_retries` attempts
/// have been made the channel stops restarting itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub cap_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2,
            cap_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before the reconnect that follows `retry_count` earlier attempts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.multiplier
            .max(1)
            .checked_pow(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.cap_delay, |delay| delay.min(self.cap_delay))
    }

    /// Whether another automatic reconnect is allowed after `retry_count` attempts.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
