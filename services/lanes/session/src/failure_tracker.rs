//! Reconnect budget shared by every lane of one session manager

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Counts consecutive lane failures across all lanes and hands out
/// exponential backoff delays until the cap is exceeded.
#[derive(Debug)]
pub struct ReconnectBudget {
    /// Consecutive failures since the last success or reset
    attempts: AtomicU32,
    /// Latched once the cap is exceeded; cleared only by `reset`
    exhausted: AtomicBool,
    base_delay: Duration,
    max_attempts: u32,
}

impl ReconnectBudget {
    /// Create a budget allowing `max_attempts` reconnects starting at `base_delay`
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            base_delay,
            max_attempts,
        }
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` once the budget is spent.
    ///
    /// The n-th consecutive failure waits `base * 2^(n-1)`.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.exhausted.load(Ordering::Acquire) {
            return None;
        }

        let claimed = self
            .attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_attempts).then_some(n + 1)
            });

        match claimed {
            Ok(previous) => {
                let delay = self
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(previous));
                debug!(
                    "Reconnect attempt {}/{} in {:?}",
                    previous + 1,
                    self.max_attempts,
                    delay
                );
                Some(delay)
            }
            Err(_) => {
                if !self.exhausted.swap(true, Ordering::AcqRel) {
                    warn!(
                        "Reconnect budget exhausted after {} attempts",
                        self.max_attempts
                    );
                }
                None
            }
        }
    }

    /// A lane connected; clears the failure streak unless already exhausted
    pub fn record_success(&self) {
        if !self.exhausted.load(Ordering::Acquire) {
            let previous = self.attempts.swap(0, Ordering::AcqRel);
            if previous > 0 {
                debug!("Lane recovered after {} failed attempts", previous);
            }
        }
    }

    /// Clear the streak and the exhausted latch
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Release);
        self.exhausted.store(false, Ordering::Release);
    }

    /// Consecutive failures counted so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Whether the cap has been exceeded
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_exhausted() {
        let budget = ReconnectBudget::new(Duration::from_secs(1), 5);

        let delays: Vec<_> = (0..5).map(|_| budget.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 16]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );

        assert_eq!(budget.next_delay(), None);
        assert!(budget.is_exhausted());
        assert_eq!(budget.next_delay(), None);
    }

    #[test]
    fn test_success_resets_streak() {
        let budget = ReconnectBudget::new(Duration::from_millis(100), 3);
        budget.next_delay();
        budget.next_delay();
        assert_eq!(budget.attempts(), 2);

        budget.record_success();
        assert_eq!(budget.attempts(), 0);
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_exhaustion_survives_success_until_reset() {
        let budget = ReconnectBudget::new(Duration::from_millis(10), 1);
        assert!(budget.next_delay().is_some());
        assert!(budget.next_delay().is_none());

        budget.record_success();
        assert!(budget.is_exhausted());
        assert!(budget.next_delay().is_none());

        budget.reset();
        assert!(!budget.is_exhausted());
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_zero_attempts_gives_up_immediately() {
        let budget = ReconnectBudget::new(Duration::from_secs(1), 0);
        assert_eq!(budget.next_delay(), None);
        assert!(budget.is_exhausted());
    }
}
