//! Reconnect delay state machine.

use std::time::Duration;

/// Reconnect and handshake settings for the connection loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect, and after any successful link.
    pub min_delay: Duration,
    /// Upper bound of the delay.
    pub max_delay: Duration,
    /// Growth per failed attempt.
    pub factor: f64,
    /// Limit on establishing one link.
    pub handshake_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            factor: 1.5,
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub const fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Current reconnect delay plus the rule to grow it.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    delay: Duration,
    min: Duration,
    max: Duration,
    factor: f64,
}

impl ReconnectBackoff {
    #[must_use]
    pub const fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            delay: min,
            min,
            max,
            factor,
        }
    }

    #[must_use]
    pub const fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.min_delay, config.max_delay, config.factor)
    }

    /// Delay the next reconnect would wait.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.delay
    }

    /// Delay following `current`: grown by the factor, capped at the maximum.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.factor.max(1.0));
        grown.min(self.max)
    }

    /// Take the current delay and grow it for the attempt after.
    pub fn advance(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = self.next_delay(delay);
        delay
    }

    /// Back to the minimum, after a link was established.
    pub const fn reset(&mut self) {
        self.delay = self.min;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence_caps_at_max() {
        let mut backoff = ReconnectBackoff::default();
        let delays: Vec<u128> = (0..9).map(|_| backoff.advance().as_millis()).collect();
        assert_eq!(
            delays,
            vec![2000, 3000, 4500, 6750, 10125, 15187, 22781, 30000, 30000]
        );
    }

    #[test]
    fn test_reset_returns_to_min() {
        let mut backoff = ReconnectBackoff::default();
        backoff.advance();
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(4500));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    #[test]
    fn test_next_delay_is_pure() {
        let backoff = ReconnectBackoff::default();
        assert_eq!(
            backoff.next_delay(Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert_eq!(
            backoff.next_delay(Duration::from_secs(29)),
            Duration::from_secs(30)
        );
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }
}
