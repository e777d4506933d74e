//! Validated configuration primitives.
//!
//! Plain value types with validating constructors. `harness::config` wraps
//! these behind `clap` for process-level configuration; this crate stays
//! free of any CLI dependency.

use crate::error::{Error, Result};
use std::time::Duration;

/// `batchSize` for a `claim` call. Spec: default 50, range 1-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSize(i64);

impl BatchSize {
    pub const DEFAULT: i64 = 50;
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 100;

    pub fn new(value: i64) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(Error::validation(format!(
                "batch size {value} out of range [{}, {}]",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

/// `leaseSeconds` for a `claim` call. Spec: default 30, minimum 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSeconds(i64);

impl LeaseSeconds {
    pub const DEFAULT: i64 = 30;
    pub const MIN: i64 = 10;

    pub fn new(value: i64) -> Result<Self> {
        if value < Self::MIN {
            return Err(Error::validation(format!(
                "lease seconds {value} below minimum {}",
                Self::MIN
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0.max(0) as u64)
    }
}

impl Default for LeaseSeconds {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

/// A resource or semaphore name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName(String);

impl ResourceName {
    pub const MAX_LEN: usize = 200;

    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || value.len() > Self::MAX_LEN {
            return Err(Error::validation(format!(
                "resource name length must be in 1..={}, got {}",
                Self::MAX_LEN,
                value.len()
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '/' | '.'))
        {
            return Err(Error::validation(format!(
                "resource name {value:?} contains characters outside [A-Za-z0-9-_:/.]"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An Outbox/Inbox `topic`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub const MAX_LEN: usize = 255;

    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || value.len() > Self::MAX_LEN {
            return Err(Error::validation(format!(
                "topic length must be in 1..={}, got {}",
                Self::MAX_LEN,
                value.len()
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Semaphore-wide bounds a deployment enforces on every `tryAcquire`/
/// `ensureExists` call. Constructed once at startup from `HarnessConfig` and
/// handed to `SemaphoreStore`, the same validate-at-the-boundary idiom as
/// `BatchSize`/`LeaseSeconds`.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreLimits {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub max_limit: i32,
}

impl SemaphoreLimits {
    pub fn new(min_ttl: Duration, max_ttl: Duration, max_limit: i32) -> Result<Self> {
        if min_ttl > max_ttl {
            return Err(Error::validation(format!(
                "semaphore min_ttl {min_ttl:?} must be <= max_ttl {max_ttl:?}"
            )));
        }
        if max_limit < 1 {
            return Err(Error::validation("semaphore max_limit must be >= 1"));
        }
        Ok(Self { min_ttl, max_ttl, max_limit })
    }

    pub fn validate_ttl(&self, ttl: Duration) -> Result<()> {
        if ttl < self.min_ttl || ttl > self.max_ttl {
            return Err(Error::validation(format!(
                "semaphore ttl {ttl:?} out of range [{:?}, {:?}]",
                self.min_ttl, self.max_ttl
            )));
        }
        Ok(())
    }

    pub fn validate_limit(&self, limit: i32) -> Result<()> {
        if !(1..=self.max_limit).contains(&limit) {
            return Err(Error::validation(format!(
                "semaphore limit {limit} out of range [1, {}]",
                self.max_limit
            )));
        }
        Ok(())
    }
}

impl Default for SemaphoreLimits {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(5),
            max_ttl: Duration::from_secs(3600),
            max_limit: 1000,
        }
    }
}

/// Retry/backoff bounds shared by every WorkQueue dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub retry_ceiling: i32,
}

impl BackoffPolicy {
    /// Default `abandon` delay: `min(2^retryCount, 60) s`.
    pub fn retry_delay(&self, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 30) as u32;
        let secs = 2u64.saturating_pow(exp).min(self.cap.as_secs());
        Duration::from_secs(secs)
    }

    /// Empty-claim poll backoff: base 0.25 s, cap 30 s by default.
    pub fn poll_delay(&self, consecutive_empty: u32) -> Duration {
        let exp = consecutive_empty.min(16);
        let millis = (self.base.as_secs_f64() * 2f64.powi(exp as i32) * 1000.0)
            .min(self.cap.as_secs_f64() * 1000.0);
        Duration::from_millis(millis as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(30),
            retry_ceiling: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_rejects_out_of_range() {
        assert!(BatchSize::new(0).is_err());
        assert!(BatchSize::new(101).is_err());
        assert_eq!(BatchSize::new(50).unwrap().get(), 50);
    }

    #[test]
    fn lease_seconds_rejects_below_minimum() {
        assert!(LeaseSeconds::new(9).is_err());
        assert_eq!(LeaseSeconds::new(10).unwrap().get(), 10);
        assert_eq!(LeaseSeconds::new(30).unwrap().as_duration(), Duration::from_secs(30));
    }

    #[test]
    fn resource_name_rejects_empty_and_invalid_chars() {
        assert!(ResourceName::new("").is_err());
        assert!(ResourceName::new("a".repeat(201)).is_err());
        assert!(ResourceName::new("bad name!").is_err());
        assert_eq!(
            ResourceName::new("scheduler:default").unwrap().as_str(),
            "scheduler:default"
        );
    }

    #[test]
    fn topic_rejects_empty_and_too_long() {
        assert!(Topic::new("").is_err());
        assert!(Topic::new("a".repeat(256)).is_err());
        assert_eq!(Topic::new("demo.echo").unwrap().as_str(), "demo.echo");
    }

    #[test]
    fn retry_delay_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.retry_delay(0), Duration::from_secs(1));
        assert_eq!(policy.retry_delay(1), Duration::from_secs(2));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(8));
        assert_eq!(policy.retry_delay(10), Duration::from_secs(30));
        assert_eq!(policy.retry_delay(30), Duration::from_secs(30));
    }

    #[test]
    fn semaphore_limits_reject_inverted_ttl_range_and_zero_max_limit() {
        assert!(SemaphoreLimits::new(Duration::from_secs(10), Duration::from_secs(5), 10).is_err());
        assert!(SemaphoreLimits::new(Duration::from_secs(5), Duration::from_secs(10), 0).is_err());
    }

    #[test]
    fn semaphore_limits_validate_ttl_and_limit_ranges() {
        let limits = SemaphoreLimits::new(Duration::from_secs(5), Duration::from_secs(60), 10).unwrap();
        assert!(limits.validate_ttl(Duration::from_secs(4)).is_err());
        assert!(limits.validate_ttl(Duration::from_secs(61)).is_err());
        assert!(limits.validate_ttl(Duration::from_secs(30)).is_ok());
        assert!(limits.validate_limit(0).is_err());
        assert!(limits.validate_limit(11).is_err());
        assert!(limits.validate_limit(10).is_ok());
    }

    #[test]
    fn poll_delay_grows_from_base_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.poll_delay(0), Duration::from_millis(250));
        assert_eq!(policy.poll_delay(1), Duration::from_millis(500));
        assert_eq!(policy.poll_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.poll_delay(16), Duration::from_secs(30));
    }
}
