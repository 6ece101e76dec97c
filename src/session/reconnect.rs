//! Reconnection Backoff
//!
//! Exponential backoff with jitter for session (re-)establishment. Attempts
//! are bounded per incident; exhausting them sends the session to the
//! degraded state.

use std::time::Duration;

use rand::Rng;

/// Configuration for the backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts allowed per incident (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl From<&crate::config::SessionSettings> for BackoffConfig {
    fn from(settings: &crate::config::SessionSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_login_attempts,
        }
    }
}

/// One incident's worth of backoff state.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next_base: Duration,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh schedule.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let next_base = config.initial_delay;
        Self {
            config,
            next_base,
            attempts: 0,
        }
    }

    /// The delay to sleep before the next attempt, or `None` when the
    /// attempt budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = self.jittered(self.next_base);

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let grown = (self.next_base.as_millis() as f64 * self.config.multiplier) as u64;
        self.next_base = Duration::from_millis(grown).min(self.config.max_delay);

        Some(delay)
    }

    /// Attempts consumed so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return base;
        }
        #[allow(clippy::cast_precision_loss)]
        let millis = base.as_millis() as f64;
        let spread = millis * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis((millis + offset).max(1.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::new(no_jitter(0));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        // Capped.
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn budget_exhausts() {
        let mut backoff = Backoff::new(no_jitter(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut backoff = Backoff::new(BackoffConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
            });
            let millis = backoff.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of bounds");
        }
    }

    #[test]
    fn zero_max_attempts_never_exhausts() {
        let mut backoff = Backoff::new(no_jitter(0));
        for _ in 0..50 {
            assert!(backoff.next_delay().is_some());
        }
    }
}
