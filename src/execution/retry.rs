//! Retry backoff computation

use crate::core::{BackoffType, RetryPolicy};
use std::time::Duration;

/// Largest shift applied by exponential backoff; keeps `2^n` inside `u64`
const MAX_EXPONENT: u32 = 32;

/// Delay before retrying a failure at zero-based attempt `retry_count`
///
/// - `fixed`: `backoff_delay`
/// - `exponential`: `backoff_delay * 2^retry_count`, saturating
pub fn backoff_delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let millis = match policy.backoff_type {
        BackoffType::Fixed => policy.backoff_delay,
        BackoffType::Exponential => {
            let factor = 1u64 << retry_count.min(MAX_EXPONENT);
            policy.backoff_delay.saturating_mul(factor)
        }
    };
    Duration::from_millis(millis)
}
