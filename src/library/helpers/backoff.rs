//! Exponential backoff for reconnection attempts

use std::{iter::Iterator, time::Duration};

/// Exponential backoff iterator
///
/// Yields increasing delays until `limit` attempts have been handed out. Each delay is the
/// previous one multiplied by `multiplier`, capped at `ceiling` so that a broker which stays
/// unreachable for a long time is still probed at a sane interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    limit: u32,
    multiplier: u32,
    initial: Duration,
    current: Duration,
    ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 10)
    }
}

impl Backoff {
    /// Creates a new instance starting at `initial` and yielding at most `limit` delays
    pub fn new(initial: Duration, limit: u32) -> Self {
        Self {
            attempts: 0,
            limit,
            multiplier: 2,
            initial,
            current: initial,
            ceiling: Duration::from_secs(10),
        }
    }

    /// Caps every yielded delay at the given duration
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Number of delays handed out since creation or the last [`reset`](Backoff::reset)
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Starts over after a successful attempt
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.initial;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempts >= self.limit {
            return None;
        }

        let delay = self.current.min(self.ceiling);
        self.attempts += 1;
        self.current = self.current.saturating_mul(self.multiplier);

        Some(delay)
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn increase_until_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), 8).with_ceiling(Duration::from_secs(1));
        let delays: Vec<_> = backoff.collect();

        assert_eq!(delays.len(), 8);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn start_over_after_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(10), 2);

        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next(), None);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
    }
}
