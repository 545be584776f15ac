//! Wall-clock milliseconds and deadline arithmetic.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Computes `now + timeout`, clamping to `u64::MAX` instead of wrapping.
///
/// A deadline of `u64::MAX` means "never time out". Deadlines are compared
/// against an advancing clock, so wrapping here would turn a large timeout
/// into an immediate expiry.
pub fn deadline_saturating(now: u64, timeout: u64) -> u64 {
    now.saturating_add(timeout)
}
