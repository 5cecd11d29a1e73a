//! Retry policies and per-record retry admission

use crate::consumer::config::duration_ms;
use crate::consumer::record::RecordKey;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Maximum allowed retry attempts to prevent a poison record from pinning a worker forever
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Maximum backoff duration
const MAX_BACKOFF_MILLIS: u64 = 3_600_000; // 1 hour
/// Maximum multiplier to prevent exponential explosion
const MAX_MULTIPLIER: f64 = 100.0;
/// Maximum jitter factor
const MAX_JITTER_FACTOR: f64 = 1.0;

/// Default retries per record
pub const DEFAULT_MAX_RETRIES: u32 = 5;

fn validate_max_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "max_retries {} exceeds maximum allowed value {}",
            value, MAX_RETRY_ATTEMPTS
        )));
    }
    Ok(value)
}

fn validate_backoff<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    if millis > MAX_BACKOFF_MILLIS {
        return Err(serde::de::Error::custom(format!(
            "backoff {}ms exceeds maximum allowed {}ms",
            millis, MAX_BACKOFF_MILLIS
        )));
    }
    Ok(Duration::from_millis(millis))
}

fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "backoff_multiplier {} must be finite and between 1.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

fn validate_jitter<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(0.0..=MAX_JITTER_FACTOR).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "jitter_factor {} must be finite and between 0.0 and {}",
            value, MAX_JITTER_FACTOR
        )));
    }
    Ok(value)
}

/// Retry policy for one topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Handler attempts before a record is acknowledged anyway; 0 disables local retry
    #[serde(deserialize_with = "validate_max_retries")]
    pub max_retries: u32,
    /// Wait before the first retry
    #[serde(
        rename = "backoff_ms",
        serialize_with = "duration_ms::serialize",
        deserialize_with = "validate_backoff"
    )]
    pub backoff: Duration,
    /// Upper bound for a grown backoff
    #[serde(
        rename = "max_backoff_ms",
        serialize_with = "duration_ms::serialize",
        deserialize_with = "validate_backoff"
    )]
    pub max_backoff: Duration,
    /// Growth factor per failure (1.0 keeps the backoff fixed)
    #[serde(deserialize_with = "validate_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(deserialize_with = "validate_jitter")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed backoff
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff
    pub fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: initial,
            max_backoff: max,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Create a policy that acknowledges failed records without retrying
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Wait before the next attempt after `failures` consecutive failures
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 || self.backoff.is_zero() {
            return Duration::ZERO;
        }

        let initial = self.backoff.as_secs_f64();
        let ceiling = self.max_backoff.max(self.backoff).as_secs_f64();

        let base = if self.backoff_multiplier > 1.0 {
            let multiplier = if failures > 30 {
                ceiling / initial
            } else {
                let multiplier = self.backoff_multiplier.powf((failures - 1) as f64);
                if multiplier.is_finite() && multiplier < 1e6 {
                    multiplier
                } else {
                    ceiling / initial
                }
            };
            (initial * multiplier).min(ceiling)
        } else {
            initial
        };

        let jitter = if self.jitter_factor > 0.0 {
            base * self.jitter_factor * rand::random::<f64>()
        } else {
            0.0
        };

        Duration::from_secs_f64(base + jitter)
    }
}

/// Per-topic retry policies with a default
///
/// An override only has to name the fields it changes. Everything else comes
/// from `default`, both when deserialized and when built through
/// [`RetryPolicies::topic_mut`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryPolicies {
    /// Policy for topics without an override
    pub default: RetryPolicy,
    /// Per-topic overrides
    pub topics: HashMap<String, RetryPolicy>,
}

impl<'de> Deserialize<'de> for RetryPolicies {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Default, Deserialize)]
        #[serde(default)]
        struct Partial {
            default: RetryPolicy,
            topics: HashMap<String, Mapping>,
        }

        let partial = Partial::deserialize(deserializer)?;
        let base = match serde_yaml::to_value(&partial.default).map_err(serde::de::Error::custom)? {
            Value::Mapping(mapping) => mapping,
            _ => Mapping::new(),
        };

        let mut topics = HashMap::with_capacity(partial.topics.len());
        for (topic, fields) in partial.topics {
            let mut merged = base.clone();
            for (field, value) in fields {
                merged.insert(field, value);
            }
            let policy = serde_yaml::from_value(Value::Mapping(merged)).map_err(|e| {
                serde::de::Error::custom(format!("retry policy for topic '{}': {}", topic, e))
            })?;
            topics.insert(topic, policy);
        }

        Ok(Self {
            default: partial.default,
            topics,
        })
    }
}

impl RetryPolicies {
    /// Policy that applies to `topic`
    pub fn for_topic(&self, topic: &str) -> &RetryPolicy {
        self.topics.get(topic).unwrap_or(&self.default)
    }

    /// Mutable override for `topic`, seeded from the current default policy
    pub fn topic_mut(&mut self, topic: &str) -> &mut RetryPolicy {
        let default = self.default.clone();
        self.topics.entry(topic.to_string()).or_insert(default)
    }
}

/// Decision taken for one handler outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handler succeeded
    Acked,
    /// Handler failed on a topic with local retry disabled
    OptedOut,
    /// Handler failed; try the same record again
    Retry {
        /// Failures recorded so far
        failures: u32,
    },
    /// Retry budget used up; the record is acknowledged anyway
    Exhausted {
        /// Failures recorded, equal to the budget
        failures: u32,
    },
}

impl Admission {
    /// Whether the record should now be acknowledged
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Retry { .. })
    }
}

/// Failure counts keyed by `(topic, partition, offset)`
///
/// A key is only present while its count is in `[1, max_retries)`.
#[derive(Debug, Default)]
pub struct RetryLedger {
    failures: DashMap<RecordKey, u32>,
}

impl RetryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handler outcome and decide whether the record may be acknowledged
    pub fn admit(&self, key: &RecordKey, succeeded: bool, policy: &RetryPolicy) -> Admission {
        if succeeded {
            self.failures.remove(key);
            return Admission::Acked;
        }

        let max_retries = policy.max_retries;
        if max_retries == 0 {
            debug!(
                topic = %key.topic,
                partition = key.partition,
                offset = key.offset,
                "Record handler failed, local retry disabled for topic"
            );
            return Admission::OptedOut;
        }

        let failures = {
            let mut count = self.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= max_retries {
            self.failures.remove(key);
            error!(
                topic = %key.topic,
                partition = key.partition,
                offset = key.offset,
                failures,
                max_retries,
                "Record handler exceeded max retries, acknowledging record"
            );
            Admission::Exhausted { failures }
        } else {
            warn!(
                topic = %key.topic,
                partition = key.partition,
                offset = key.offset,
                failures,
                max_retries,
                "Record handler failed, will retry"
            );
            Admission::Retry { failures }
        }
    }

    /// Drop the entry for a record that will not be retried any further
    pub fn forget(&self, key: &RecordKey) {
        self.failures.remove(key);
    }

    /// Current failure count for a record
    pub fn failures(&self, key: &RecordKey) -> Option<u32> {
        self.failures.get(key).map(|count| *count)
    }

    /// Number of records currently failing
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Check if no record is currently failing
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_support::capture_levels;
    use rstest::rstest;
    use tracing::Level;

    fn key(offset: i64) -> RecordKey {
        RecordKey {
            topic: "orders".to_string(),
            partition: 0,
            offset,
        }
    }

    #[test]
    fn test_fail_twice_then_succeed() {
        let ledger = RetryLedger::new();
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        let (outcomes, levels) = capture_levels(|| {
            vec![
                ledger.admit(&key(7), false, &policy),
                ledger.admit(&key(7), false, &policy),
                ledger.admit(&key(7), true, &policy),
            ]
        });

        assert_eq!(
            outcomes,
            vec![
                Admission::Retry { failures: 1 },
                Admission::Retry { failures: 2 },
                Admission::Acked,
            ]
        );
        assert!(ledger.is_empty());
        assert_eq!(levels.iter().filter(|l| **l == Level::WARN).count(), 2);
        assert!(!levels.contains(&Level::ERROR));
    }

    #[test]
    fn test_always_failing_record_exhausts() {
        let ledger = RetryLedger::new();
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        let (outcomes, levels) = capture_levels(|| {
            let mut outcomes = Vec::new();
            loop {
                let admission = ledger.admit(&key(9), false, &policy);
                outcomes.push(admission);
                if admission.is_admitted() {
                    break outcomes;
                }
                assert_eq!(ledger.failures(&key(9)), Some(outcomes.len() as u32));
            }
        });

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2], Admission::Exhausted { failures: 3 });
        assert_eq!(ledger.failures(&key(9)), None);
        assert_eq!(levels.iter().filter(|l| **l == Level::ERROR).count(), 1);
    }

    #[test]
    fn test_opted_out_topic_acks_immediately() {
        let ledger = RetryLedger::new();
        let admission = ledger.admit(&key(1), false, &RetryPolicy::no_retry());

        assert_eq!(admission, Admission::OptedOut);
        assert!(admission.is_admitted());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_keys_are_isolated() {
        let ledger = RetryLedger::new();
        let policy = RetryPolicy::fixed(5, Duration::ZERO);

        ledger.admit(&key(1), false, &policy);
        ledger.admit(&key(1), false, &policy);
        ledger.admit(&key(2), false, &policy);

        assert_eq!(ledger.failures(&key(1)), Some(2));
        assert_eq!(ledger.failures(&key(2)), Some(1));

        ledger.admit(&key(1), true, &policy);
        assert_eq!(ledger.len(), 1);
    }

    #[rstest]
    #[case(0, Duration::ZERO)]
    #[case(1, Duration::from_millis(100))]
    #[case(2, Duration::from_millis(200))]
    #[case(3, Duration::from_millis(400))]
    #[case(10, Duration::from_secs(1))]
    fn test_exponential_backoff_is_capped(#[case] failures: u32, #[case] expected: Duration) {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::exponential(20, Duration::from_millis(100), Duration::from_secs(1))
        };
        assert_eq!(policy.backoff_for(failures), expected);
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(500));
        assert_eq!(RetryPolicy::default().backoff_for(4), Duration::ZERO);
    }

    #[test]
    fn test_topic_overrides() {
        let mut policies = RetryPolicies::default();
        policies.topic_mut("payments").max_retries = 10;
        policies.topic_mut("payments").backoff = Duration::from_millis(500);

        assert_eq!(policies.for_topic("payments").max_retries, 10);
        assert_eq!(policies.for_topic("orders").max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(policies.for_topic("orders").backoff, Duration::ZERO);
    }

    #[test]
    fn test_retry_policy_validation() {
        let valid = "max_retries: 5\nbackoff_ms: 250\nbackoff_multiplier: 2.0\n";
        let policy: RetryPolicy = serde_yaml::from_str(valid).unwrap();
        assert_eq!(policy.backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));

        let too_many = "max_retries: 10000\n";
        assert!(serde_yaml::from_str::<RetryPolicy>(too_many).is_err());

        let too_long = "backoff_ms: 7200000\n";
        assert!(serde_yaml::from_str::<RetryPolicy>(too_long).is_err());

        let shrinking = "backoff_multiplier: 0.5\n";
        assert!(serde_yaml::from_str::<RetryPolicy>(shrinking).is_err());

        let jitter = "jitter_factor: 1.5\n";
        assert!(serde_yaml::from_str::<RetryPolicy>(jitter).is_err());
    }

    #[test]
    fn test_yaml_override_inherits_configured_default() {
        let yaml = r#"
default:
  max_retries: 3
  backoff_ms: 200
  backoff_multiplier: 2.0
topics:
  payments:
    max_retries: 9
  audit:
    backoff_ms: 50
"#;
        let policies: RetryPolicies = serde_yaml::from_str(yaml).unwrap();

        let payments = policies.for_topic("payments");
        assert_eq!(payments.max_retries, 9);
        assert_eq!(payments.backoff, Duration::from_millis(200));
        assert_eq!(payments.backoff_multiplier, 2.0);

        let audit = policies.for_topic("audit");
        assert_eq!(audit.max_retries, 3);
        assert_eq!(audit.backoff, Duration::from_millis(50));

        let mut built = RetryPolicies {
            default: policies.default.clone(),
            ..Default::default()
        };
        built.topic_mut("payments").max_retries = 9;
        assert_eq!(built.for_topic("payments"), payments);
    }

    #[test]
    fn test_yaml_override_is_validated() {
        let yaml = "topics:\n  payments:\n    max_retries: 10000\n";
        let err = serde_yaml::from_str::<RetryPolicies>(yaml).unwrap_err();
        assert!(err.to_string().contains("payments"));
    }
}
