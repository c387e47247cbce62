//! Jittered exponential backoff for reconnects and recovery timers.

use rand::Rng;
use std::time::Duration;

/// Stateful exponential backoff with bounded jitter.
///
/// Each call to [`Backoff::next_delay`] doubles (by `factor`) the base delay
/// up to `max`, then applies `± jitter` proportional randomization. Reset
/// after a successful attempt to start the ladder over.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff ladder.
    ///
    /// `jitter` is clamped to `[0, 1]`; a value of 0.1 produces delays in
    /// `[0.9 * d, 1.1 * d]`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Ladder tuned for broker reconnects: 100ms doubling to 10s, 10% jitter.
    #[must_use]
    pub fn reconnect() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10), 2.0, 0.1)
    }

    /// Ladder tuned for circuit-breaker recovery: 1s doubling to 5min, 20% jitter.
    #[must_use]
    pub fn recovery() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 2.0, 0.2)
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Return the next delay and advance the ladder.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        self.attempt = self.attempt.saturating_add(1);

        let base_ms = (self.initial.as_millis() as f64) * self.factor.powi(exponent);
        let capped_ms = base_ms.min(self.max.as_millis() as f64);

        if self.jitter <= 0.0 {
            return Duration::from_millis(capped_ms.max(0.0) as u64);
        }

        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered_ms = capped_ms * (1.0 + spread);
        Duration::from_millis(jittered_ms.max(0.0) as u64)
    }

    /// Peek at the un-jittered delay for a given attempt without advancing.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_ms = (self.initial.as_millis() as f64) * self.factor.powi(exponent);
        Duration::from_millis(base_ms.min(self.max.as_millis() as f64).max(0.0) as u64)
    }

    /// Start the ladder over after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0, 0.0);
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(20), Duration::from_secs(1));
    }

    #[test]
    fn test_next_delay_advances_and_resets() {
        let mut backoff =
            Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0, 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff =
            Backoff::new(Duration::from_millis(1000), Duration::from_secs(10), 2.0, 0.1);
        for _ in 0..20 {
            backoff.reset();
            let d = backoff.next_delay().as_millis();
            assert!((900..=1100).contains(&d), "delay {d} outside jitter band");
        }
    }
}
