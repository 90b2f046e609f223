//! Classified retry backoff (spec §4.2, §4.3, §8 invariant 6).

use std::time::Duration;

use rand::Rng;

use crate::error::ErrorClass;

/// Base delay for a given error class (spec §4.2):
/// throttled => 5s, conflict => 2s, else => 1s.
pub fn base_delay(class: ErrorClass) -> Duration {
    match class {
        ErrorClass::Throttled => Duration::from_secs(5),
        ErrorClass::Conflict => Duration::from_secs(2),
        ErrorClass::Retryable | ErrorClass::Permanent => Duration::from_secs(1),
    }
}

/// `base * 2^attempt`, capped at `cap`, plus up to +25% jitter.
pub fn compute_backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let raw = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = raw.min(cap.as_secs_f64());
    let jitter_factor = 1.0 + rand::rng().random_range(0.0..=0.25);
    Duration::from_secs_f64(capped * jitter_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_bounds() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);
        for attempt in 0..5 {
            let delay = compute_backoff(base, attempt, cap);
            let raw = base.as_secs_f64() * 2f64.powi(attempt as i32);
            let capped_upper = 1.25 * raw.min(cap.as_secs_f64());
            assert!(delay.as_secs_f64() >= raw - 1e-9 || raw > cap.as_secs_f64());
            assert!(delay.as_secs_f64() <= capped_upper + 1e-9);
        }
    }

    #[test]
    fn base_delay_matches_classification() {
        assert_eq!(base_delay(ErrorClass::Throttled), Duration::from_secs(5));
        assert_eq!(base_delay(ErrorClass::Conflict), Duration::from_secs(2));
        assert_eq!(base_delay(ErrorClass::Retryable), Duration::from_secs(1));
    }

    #[test]
    fn backoff_never_exceeds_cap_by_more_than_25_percent() {
        let delay = compute_backoff(Duration::from_secs(5), 10, Duration::from_secs(60));
        assert!(delay.as_secs_f64() <= 75.0);
    }
}
