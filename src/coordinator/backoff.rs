//! Backoff schedule for retryable sync failures.
//!
//! A pure function of the attempt number so the schedule is testable
//! without timers: the coordinator supplies a random jitter fraction at
//! the call site, tests pass a fixed one.

use std::time::Duration;

/// Delay before retry number `attempt` (0-based).
///
/// `base * 2^attempt`, inflated by up to 30% of itself according to
/// `jitter_frac` in `[0, 1)`, capped at `max`. Non-decreasing in
/// expectation over attempts and never exceeds `max`.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter_frac: f64) -> Duration {
    let exponential = base
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .min(max);
    let jitter_frac = jitter_frac.clamp(0.0, 1.0);
    let with_jitter = exponential.mul_f64(1.0 + 0.3 * jitter_frac);
    with_jitter.min(max)
}
