//! Linear-backoff reconnect policy for streaming channels.
//!
//! The n-th reconnect attempt waits `base_delay * n`. Once more than
//! `max_attempts` attempts would be needed the channel gives up and
//! reports a terminal transport error.

use std::time::Duration;

/// Tunable parameters for the reconnect strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay unit; attempt `n` waits `n` units.
    pub base_delay: Duration,
    /// Number of reconnect attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
///
/// Returns `None` when `attempt` exceeds the configured cap.
pub fn delay_for_attempt(attempt: u32, config: &ReconnectConfig) -> Option<Duration> {
    if attempt == 0 || attempt > config.max_attempts {
        return None;
    }
    Some(config.base_delay.saturating_mul(attempt))
}
