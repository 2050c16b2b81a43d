//! Typed, non-loading configuration for every worker in the pipeline.
//!
//! Nothing in this crate reads an environment variable or a file: every
//! tunable arrives as a plain struct with a `Default` impl encoding the
//! spec's stated defaults. Loading those values from the environment is the
//! job of the (out-of-scope) HTTP/CLI collaborator.

use std::time::Duration;

/// Process-wide bootstrap values that would otherwise be global singletons
/// (the encryption key, pool sizing). Constructed once by the caller and
/// threaded through every worker's constructor.
#[derive(Clone)]
pub struct Bootstrap {
    /// AEAD key for field-level encryption. `None` means encryption is
    /// disabled; encrypting a field registered as `is_encrypted` without a
    /// key fails fast (`SerializerError::IntegrityError`), it is never
    /// silently skipped.
    pub encryption_key: Option<[u8; 32]>,
    pub redis_pool_size: u32,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            encryption_key: None,
            redis_pool_size: 20,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SerializerConfig {
    /// Blobs at or above this length (after field encryption, before
    /// framing) are compressed.
    pub compression_threshold_bytes: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct BatcherConfig {
    pub flush_interval_ms: u64,
    pub batch_size_threshold: usize,
    pub max_queue_depth: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            batch_size_threshold: 100,
            max_queue_depth: 10_000,
        }
    }
}

impl BatcherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SweeperConfig {
    pub sweep_interval_ms: u64,
    pub pending_threshold_ms: i64,
    pub dispatched_threshold_ms: i64,
    pub max_attempts: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
            pending_threshold_ms: 60_000,
            dispatched_threshold_ms: 60_000,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PollerConfig {
    pub poll_interval_ms: u64,
    pub ack_flush_interval_ms: u64,
    pub ack_flush_size_threshold: usize,
    pub max_retries: u32,
    pub retry_backoff_base: u32,
    pub retry_backoff_unit_ms: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            ack_flush_interval_ms: 100,
            ack_flush_size_threshold: 50,
            max_retries: 5,
            retry_backoff_base: 2,
            retry_backoff_unit_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct CoordinatorConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: i64,
    pub lock_ttl_ms: i64,
    pub partition_count: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 3_000,
            heartbeat_timeout_ms: 10_000,
            lock_ttl_ms: 5_000,
            partition_count: 16,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ConsumerConfig {
    pub block_time_ms: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_base: u32,
    pub retry_backoff_unit_ms: i64,
    /// How many past calendar days of `events:{type}:{yyyy-mm-dd}` streams a
    /// consumer listens on, in addition to today (UTC).
    pub partition_days_lookback: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 5_000,
            batch_size: 100,
            max_retries: 3,
            retry_backoff_base: 2,
            retry_backoff_unit_ms: 1_000,
            partition_days_lookback: 1,
        }
    }
}

/// `nextRetryAt = now + base^retryCount * unit`, shared by the consumer and
/// the outbox poller.
pub fn retry_backoff(base: u32, unit_ms: i64, retry_count: u32) -> Duration {
    let multiplier = base.checked_pow(retry_count).unwrap_or(u32::MAX);
    let millis = (multiplier as i64).saturating_mul(unit_ms).max(0) as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(retry_backoff(2, 1_000, 0), Duration::from_millis(1_000));
        assert_eq!(retry_backoff(2, 1_000, 1), Duration::from_millis(2_000));
        assert_eq!(retry_backoff(2, 1_000, 3), Duration::from_millis(8_000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        // Must not panic for large retry counts; the exact ceiling doesn't
        // matter, only that it stays finite and large.
        let d = retry_backoff(2, 1_000, 1_000);
        assert!(d.as_millis() > 0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 512,
                ..ProptestConfig::default()
            })]

            /// Backoff never panics and never decreases as `retry_count` grows.
            #[test]
            fn backoff_is_monotonically_nondecreasing(
                base in 1u32..8,
                unit_ms in 1i64..10_000,
                retry_count in 0u32..64,
            ) {
                let current = retry_backoff(base, unit_ms, retry_count);
                let next = retry_backoff(base, unit_ms, retry_count + 1);
                prop_assert!(next >= current);
            }
        }
    }
}
