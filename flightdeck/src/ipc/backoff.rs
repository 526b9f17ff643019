//! Deadlines and adaptive backoff for timed waits on shared memory.
//!
//! Channel operations across processes have no futex to park on, so every
//! blocking call polls. [`Backoff`] spins first, then yields, then sleeps in
//! growing steps capped at [`MAX_SLEEP`], which keeps latency low for hot
//! channels without burning a core on idle ones.

use std::time::Duration;

use minstant::Instant;

/// Longest single sleep between two polls.
pub const MAX_SLEEP: Duration = Duration::from_millis(2);

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Starts the clock for `timeout`.
    ///
    /// A duration too large to represent as an instant never expires.
    #[must_use]
    pub fn after(timeout: Timeout) -> Self {
        match timeout {
            Timeout::Infinite => Self(None),
            Timeout::Duration(d) => Self(Instant::now().checked_add(d)),
        }
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        matches!(self.0, Some(dl) if Instant::now() >= dl)
    }

    /// Time left, `None` for an infinite deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|dl| dl.checked_duration_since(Instant::now()).unwrap_or_default())
    }
}

/// Spin, then yield, then sleep.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits a little, more each call. Never sleeps past `deadline`.
    pub fn snooze(&mut self, deadline: &Deadline) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step < SPIN_LIMIT + YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let exp = (self.step - SPIN_LIMIT - YIELD_LIMIT).min(5);
            let mut nap = Duration::from_micros(50u64 << exp).min(MAX_SLEEP);
            if let Some(left) = deadline.remaining() {
                nap = nap.min(left);
            }
            if !nap.is_zero() {
                std::thread::sleep(nap);
            }
        }
        self.step = self.step.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_deadline_never_expires() {
        let deadline = Deadline::after(Timeout::Infinite);
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn test_zero_deadline_expires_immediately() {
        let deadline = Deadline::after(Duration::ZERO.into());
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_huge_duration_is_infinite() {
        let deadline = Deadline::after(Duration::MAX.into());
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn test_backoff_respects_deadline() {
        let deadline = Deadline::after(Duration::from_millis(30).into());
        let start = std::time::Instant::now();
        let mut backoff = Backoff::new();
        while !deadline.expired() {
            backoff.snooze(&deadline);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(500), "overslept: {elapsed:?}");
    }
}
