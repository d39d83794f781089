//! Rate limit parameters and per-key limit tables.
//!
//! A `RateLimitConfig` is supplied by the caller on every check. It is only
//! trusted after `validate` turns it into a `ValidatedLimit`; a zero or empty
//! field is treated the same as a missing one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::time::Duration;

use crate::error::{RateLimitError, Result};

/// Longest window a limit can use. Larger time slices are clamped to it so
/// that expiry deadlines stay representable.
pub const MAX_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Limit parameters for a single key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Identifies the entity being limited
    #[serde(default)]
    pub key: String,
    /// Calls covered by one local reservation and one store increment
    #[serde(default)]
    pub bucket_size: u64,
    /// Maximum calls admitted per time slice
    #[serde(default)]
    pub rate: u64,
    /// Window length in seconds
    #[serde(default)]
    pub time_slice: u64,
    /// Reserved for future policy; not consulted when deciding admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
}

/// A `RateLimitConfig` whose required fields are known to be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedLimit<'a> {
    pub key: &'a str,
    pub bucket_size: NonZeroU64,
    pub rate: NonZeroU64,
    pub window: Duration,
}

impl RateLimitConfig {
    /// Create a limit for `key`.
    pub fn new(key: impl Into<String>, bucket_size: u64, rate: u64, time_slice: u64) -> Self {
        Self {
            key: key.into(),
            bucket_size,
            rate,
            time_slice,
            threshold: None,
        }
    }

    /// Attach a threshold.
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Check that key, bucket size, rate and time slice are all present.
    pub fn validate(&self) -> Result<ValidatedLimit<'_>> {
        let missing = || {
            RateLimitError::Config(
                "Passed config must have bucket size, rate, time slice or key".to_string(),
            )
        };

        if self.key.is_empty() {
            return Err(missing());
        }
        let bucket_size = NonZeroU64::new(self.bucket_size).ok_or_else(missing)?;
        let rate = NonZeroU64::new(self.rate).ok_or_else(missing)?;
        if self.time_slice == 0 {
            return Err(missing());
        }

        Ok(ValidatedLimit {
            key: &self.key,
            bucket_size,
            rate,
            window: Duration::from_secs(self.time_slice).min(MAX_WINDOW),
        })
    }
}

/// Limits indexed by key.
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    limits: HashMap<String, RateLimitConfig>,
}

impl LimitTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a list of limits. Later entries win on duplicate keys.
    pub fn from_limits(limits: impl IntoIterator<Item = RateLimitConfig>) -> Self {
        Self {
            limits: limits.into_iter().map(|l| (l.key.clone(), l)).collect(),
        }
    }

    /// Parse a YAML list of limits. Every entry must validate.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let limits: Vec<RateLimitConfig> = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse limit table: {}", e)))?;

        for limit in &limits {
            limit.validate()?;
        }
        Ok(Self::from_limits(limits))
    }

    /// Look up the limit for `key`.
    pub fn get(&self, key: &str) -> Option<&RateLimitConfig> {
        self.limits.get(key)
    }

    /// Add or replace a limit.
    pub fn insert(&mut self, limit: RateLimitConfig) {
        self.limits.insert(limit.key.clone(), limit);
    }

    /// Number of keys with a limit.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Whether the table has no limits.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_complete_config() {
        let config = RateLimitConfig::new("svcA", 5, 10, 1).with_threshold(8);
        let limit = config.validate().unwrap();

        assert_eq!(limit.key, "svcA");
        assert_eq!(limit.bucket_size.get(), 5);
        assert_eq!(limit.rate.get(), 10);
        assert_eq!(limit.window, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_missing_fields() {
        let cases = [
            RateLimitConfig::new("", 5, 10, 1),
            RateLimitConfig::new("svcA", 0, 10, 1),
            RateLimitConfig::new("svcA", 5, 0, 1),
            RateLimitConfig::new("svcA", 5, 10, 0),
            RateLimitConfig::default(),
        ];

        for config in &cases {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, RateLimitError::Config(_)), "{:?}", config);
        }
    }

    #[test]
    fn test_oversized_time_slice_is_clamped() {
        let config = RateLimitConfig::new("svcA", 5, 10, u64::MAX);
        let limit = config.validate().unwrap();
        assert_eq!(limit.window, MAX_WINDOW);

        let config = RateLimitConfig::new("svcA", 5, 10, 3600);
        assert_eq!(config.validate().unwrap().window, Duration::from_secs(3600));
    }

    #[test]
    fn test_missing_yaml_field_fails_validation() {
        let yaml = r#"
- key: svcA
  bucket_size: 5
  time_slice: 1
"#;
        let err = LimitTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
    }

    #[test]
    fn test_limit_table_lookup() {
        let yaml = r#"
- key: svcA
  bucket_size: 5
  rate: 10
  time_slice: 1
- key: svcB
  bucket_size: 100
  rate: 6000
  time_slice: 60
  threshold: 5000
"#;
        let table = LimitTable::from_yaml(yaml).unwrap();
        assert_eq!(table.len(), 2);

        let b = table.get("svcB").unwrap();
        assert_eq!(b.rate, 6000);
        assert_eq!(b.threshold, Some(5000));
        assert!(table.get("svcC").is_none());
    }

    #[test]
    fn test_limit_table_later_entry_wins() {
        let mut table = LimitTable::from_limits(vec![
            RateLimitConfig::new("svcA", 5, 10, 1),
            RateLimitConfig::new("svcA", 5, 20, 1),
        ]);
        assert_eq!(table.get("svcA").unwrap().rate, 20);

        table.insert(RateLimitConfig::new("svcA", 5, 30, 1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("svcA").unwrap().rate, 30);
    }
}
