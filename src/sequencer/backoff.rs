use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Backoff settings for re-probing inactive partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde", default = "default_base")]
    pub base: Duration,
    #[serde(default = "default_max_increases")]
    pub max_increases: u32,
}

fn default_base() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_increases() -> u32 {
    10
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            max_increases: default_max_increases(),
        }
    }
}

/// Exponential retry schedule for a set of partitions that stopped producing data.
///
/// Pure state machine: the scheduler asks `should_retry` before probing and reports the
/// outcome with `try_increase` or `reset`.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    config: BackoffConfig,
    retry_count: u32,
    retry_duration: Duration,
    last_update: Option<Instant>,
}

impl BackoffTracker {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            retry_count: 0,
            retry_duration: config.base,
            last_update: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retry_duration(&self) -> Duration {
        self.retry_duration
    }

    /// Double the delay unless the cap has been reached. The update time is recorded
    /// either way so the next probe waits out the current delay.
    pub fn try_increase(&mut self) -> bool {
        self.try_increase_at(Instant::now())
    }

    pub fn try_increase_at(&mut self, now: Instant) -> bool {
        self.last_update = Some(now);
        if self.retry_count >= self.config.max_increases {
            return false;
        }
        self.retry_duration = self.retry_duration.saturating_mul(2);
        self.retry_count += 1;
        true
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.retry_duration = self.config.base;
        self.last_update = None;
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry_at(Instant::now())
    }

    pub fn should_retry_at(&self, now: Instant) -> bool {
        match self.last_update {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.retry_duration,
        }
    }
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_doubles_until_cap() {
        let mut tracker = BackoffTracker::default();
        assert_eq!(tracker.retry_duration(), Duration::from_secs(1));

        let mut seen = Vec::new();
        for _ in 0..10 {
            assert!(tracker.try_increase());
            seen.push(tracker.retry_duration().as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 64, 128, 256, 512, 1024]);
        assert_eq!(tracker.retry_count(), 10);

        // capped
        assert!(!tracker.try_increase());
        assert_eq!(tracker.retry_duration(), Duration::from_secs(1024));
        assert_eq!(tracker.retry_count(), 10);
    }

    #[test]
    fn test_reset_restores_base() {
        let mut tracker = BackoffTracker::default();
        tracker.try_increase();
        tracker.try_increase();
        tracker.reset();
        assert_eq!(tracker.retry_count(), 0);
        assert_eq!(tracker.retry_duration(), Duration::from_secs(1));
        assert!(tracker.should_retry());
    }

    #[test]
    fn test_should_retry_waits_for_current_duration() {
        let mut tracker = BackoffTracker::default();
        let start = Instant::now();
        assert!(tracker.should_retry_at(start));

        tracker.try_increase_at(start);
        // duration is now 2s
        assert!(!tracker.should_retry_at(start + Duration::from_millis(1999)));
        assert!(tracker.should_retry_at(start + Duration::from_secs(2)));
    }

    #[test]
    fn test_custom_base() {
        let mut tracker = BackoffTracker::new(BackoffConfig {
            base: Duration::from_millis(10),
            max_increases: 2,
        });
        assert!(tracker.try_increase());
        assert!(tracker.try_increase());
        assert!(!tracker.try_increase());
        assert_eq!(tracker.retry_duration(), Duration::from_millis(40));
    }
}
