//! Capped exponential backoff shared by relay receive loops and the client consumer.

use std::time::Duration;

use crate::defaults::{RECONNECT_BASE_MS, RECONNECT_MAX_MS};

/// Delay before reconnect attempt `attempt` (zero based): `min(1s * 2^attempt, 30s)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    backoff_delay_with(attempt, RECONNECT_BASE_MS, RECONNECT_MAX_MS)
}

/// Same as [`backoff_delay`] with explicit base and cap.
pub fn backoff_delay_with(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}
