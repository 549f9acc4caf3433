//! Exponential backoff shared by local stage retry and recovery retry.

use std::time::Duration;

/// Upper bound on any computed delay.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// `base × 2^(attempt−1)` for a 1-based attempt, capped at [`MAX_DELAY`].
///
/// Attempt 0 is treated as attempt 1.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    // 2^exponent with a checked shift so large attempts saturate.
    let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(multiplier).unwrap_or(MAX_DELAY).min(MAX_DELAY)
}

/// Delay for a recovery attempt: exponential when `backoff`, otherwise constant.
pub fn recovery_delay(base: Duration, attempt: u32, backoff: bool) -> Duration {
    if backoff {
        backoff_delay(base, attempt)
    } else {
        base.min(MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 0), base);
    }

    #[test]
    fn saturates_at_cap() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 64), MAX_DELAY);
        assert_eq!(backoff_delay(base, 20), MAX_DELAY);
    }

    #[test]
    fn constant_without_backoff() {
        let base = Duration::from_millis(500);
        assert_eq!(recovery_delay(base, 5, false), base);
        assert_eq!(recovery_delay(base, 3, true), Duration::from_secs(2));
    }
}
