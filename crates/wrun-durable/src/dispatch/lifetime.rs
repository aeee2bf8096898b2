//! Message lifetime budgets
//!
//! Queue backends impose a maximum message age. The dispatcher clamps every
//! handler's deadline to the message's remaining lifetime and, when the
//! budget is already spent, re-enqueues an equivalent message with a fresh
//! budget instead of invoking the handler. This guarantees progress across
//! backends regardless of how long the work sat in the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime configuration: `remaining = max_age − buffer − age`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLifetimeConfig {
    /// Maximum message age the backend tolerates.
    #[serde(with = "duration_secs")]
    pub max_age: Duration,

    /// Safety margin subtracted from the budget so handlers never race the
    /// backend's expiry.
    #[serde(with = "duration_secs")]
    pub buffer: Duration,
}

impl Default for QueueLifetimeConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(86_400),
            buffer: Duration::from_secs(3_600),
        }
    }
}

impl QueueLifetimeConfig {
    /// Set the maximum message age.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the safety buffer.
    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    /// Age of a message created at `created_at`, never negative.
    pub fn age(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (now - created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Remaining processing budget, never negative.
    pub fn remaining(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        self.max_age
            .saturating_sub(self.buffer)
            .saturating_sub(self.age(created_at, now))
    }

    /// True when the budget is spent and the message must be re-enqueued
    /// without invoking the handler.
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.remaining(created_at, now).is_zero()
    }

    /// Clamp a requested handler timeout to the remaining budget. `None`
    /// means the budget is spent.
    pub fn clamp(
        &self,
        requested: Duration,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let remaining = self.remaining(created_at, now);
        if remaining.is_zero() {
            None
        } else {
            Some(requested.min(remaining))
        }
    }
}

/// Serde support for Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_fresh_message_gets_full_budget() {
        let config = QueueLifetimeConfig::default();
        let now = Utc::now();

        let remaining = config.remaining(now, now);
        assert_eq!(remaining, Duration::from_secs(86_400 - 3_600));
        assert!(!config.is_expired(now, now));
    }

    #[test]
    fn test_budget_shrinks_with_age() {
        let config = QueueLifetimeConfig::default();
        let now = Utc::now();
        let created_at = now - ChronoDuration::hours(10);

        let remaining = config.remaining(created_at, now);
        assert_eq!(remaining, Duration::from_secs((24 - 1 - 10) * 3_600));
    }

    #[test]
    fn test_old_message_is_expired() {
        let config = QueueLifetimeConfig::default();
        let now = Utc::now();

        // 23h old + 1h buffer = budget spent exactly.
        let created_at = now - ChronoDuration::hours(23);
        assert!(config.is_expired(created_at, now));
        assert_eq!(config.clamp(Duration::from_secs(7_200), created_at, now), None);
    }

    #[test]
    fn test_clamp_caps_requested_timeout() {
        let config = QueueLifetimeConfig::default();
        let now = Utc::now();

        // 22h old: 1h of budget left; a 2h request is clamped to it.
        let created_at = now - ChronoDuration::hours(22);
        let clamped = config.clamp(Duration::from_secs(7_200), created_at, now);
        assert_eq!(clamped, Some(Duration::from_secs(3_600)));

        // A short request passes through untouched.
        let short = config.clamp(Duration::from_secs(60), created_at, now);
        assert_eq!(short, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_future_created_at_is_treated_as_fresh() {
        let config = QueueLifetimeConfig::default();
        let now = Utc::now();
        let created_at = now + ChronoDuration::minutes(5);

        assert_eq!(config.age(created_at, now), Duration::ZERO);
        assert!(!config.is_expired(created_at, now));
    }
}
