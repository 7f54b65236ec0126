//! Reconnect backoff policy.

use std::time::Duration;

/// Initial backoff delay for reconnection
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Maximum backoff delay for reconnection
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Exponential backoff: doubles per failed attempt, capped, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempts: 0,
        }
    }

    /// Delay for the current failure, advancing the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Delay for a given attempt number without advancing
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Reset after a successful subscribe
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(d: Duration) -> u64 {
        d.as_secs()
    }

    #[test]
    fn test_sequence_doubles_then_caps() {
        let mut backoff = Backoff::default();
        let seq: Vec<u64> = (0..8).map(|_| secs(backoff.next_delay())).collect();
        assert_eq!(seq, vec![5, 10, 20, 40, 80, 120, 120, 120]);
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_custom_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let seq: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(seq, vec![100, 200, 400, 800, 1000, 1000]);
    }
}
