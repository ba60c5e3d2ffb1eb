//! # Fibonacci Backoff
//!
//! Per-key retry delays for failed reconciles: 1s, 1s, 2s, 3s, 5s, 8s, ...
//! capped at a maximum. Handler-requested requeues bypass it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, in seconds.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

/// Backoff state per reconcile key (`namespace/name`)
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    states: Arc<Mutex<HashMap<String, FibonacciBackoff>>>,
    min_seconds: u64,
    max_seconds: u64,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(1, 300)
    }
}

impl BackoffTracker {
    /// Creates a tracker; every key starts at `min_seconds`.
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            min_seconds,
            max_seconds,
        }
    }

    /// Returns the next delay for the key.
    pub fn next(&self, key: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.min_seconds, self.max_seconds))
            .next_backoff()
    }

    /// Forgets the key after a successful reconcile.
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 300);

        let seconds: Vec<u64> = (0..8).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(seconds, vec![1, 1, 2, 3, 5, 8, 13, 21]);
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let mut backoff = FibonacciBackoff::new(1, 10);

        for _ in 0..6 {
            backoff.next_backoff();
        }
        // Next would be 13s, capped at 10s
        assert_eq!(backoff.next_backoff().as_secs(), 10);
        assert_eq!(backoff.next_backoff().as_secs(), 10);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(1, 300);

        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();

        assert_eq!(backoff.next_backoff().as_secs(), 1);
        assert_eq!(backoff.next_backoff().as_secs(), 1);
        assert_eq!(backoff.next_backoff().as_secs(), 2);
    }

    #[test]
    fn test_tracker_is_per_key() {
        let tracker = BackoffTracker::default();

        assert_eq!(tracker.next("ns/a").as_secs(), 1);
        assert_eq!(tracker.next("ns/a").as_secs(), 1);
        assert_eq!(tracker.next("ns/a").as_secs(), 2);
        assert_eq!(tracker.next("ns/b").as_secs(), 1);

        tracker.reset("ns/a");
        assert_eq!(tracker.next("ns/a").as_secs(), 1);
    }
}
