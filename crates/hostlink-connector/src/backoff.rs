use std::time::Duration;

use crate::config::ConnectorConfig;

/// Capped exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    max_attempts: u32,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            max,
            max_attempts,
            current: initial.min(max),
            attempts: 0,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(
            config.reconnect_backoff_initial,
            config.reconnect_backoff_max,
            config.reconnect_backoff_max_attempts,
        )
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        Some(delay)
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
