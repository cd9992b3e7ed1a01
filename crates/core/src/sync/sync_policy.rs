//! Retry classification and the backoff policy shared by the outbox and the
//! change-stream subscription manager.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy classification for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 409 | 423 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Exponential backoff with jitter, a cap and a retry ceiling.
///
/// The delay after the `n`-th consecutive failure is `base * 2^(n-1)` scaled
/// up by a random factor in `[1, 1 + jitter_ratio)`, then clamped to `cap`.
/// With `jitter_ratio <= 1` the sequence of delays is non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ratio: f64,
    /// Failures tolerated before an operation is given up on.
    pub ceiling: i32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            jitter_ratio: 0.2,
            ceiling: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter_ratio: f64, ceiling: i32) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            ceiling,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let unit = if self.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..1.0)
        } else {
            0.0
        };
        self.delay_with_unit(failures, unit)
    }

    /// Deterministic form of [`delay`](Self::delay); `unit` in `[0, 1)` picks
    /// the jitter.
    pub fn delay_with_unit(&self, failures: u32, unit: f64) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(32);
        let raw = (self.base_ms as f64) * 2_f64.powi(exponent as i32);
        let jitter = 1.0 + self.jitter_ratio.clamp(0.0, 1.0) * unit.clamp(0.0, 1.0);
        let millis = (raw * jitter).min(self.cap_ms as f64);
        Duration::from_millis(millis.round() as u64)
    }

    /// True once `retry_count` has gone past the ceiling.
    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count > self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_http_status_for_retry_policy() {
        assert_eq!(classify_http_status(500), SyncRetryClass::Retryable);
        assert_eq!(classify_http_status(429), SyncRetryClass::Retryable);
        assert_eq!(classify_http_status(401), SyncRetryClass::ReauthRequired);
        assert_eq!(classify_http_status(400), SyncRetryClass::Permanent);
        assert_eq!(classify_http_status(422), SyncRetryClass::Permanent);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = BackoffPolicy::default().without_jitter();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(60), Duration::from_secs(30));
    }

    #[test]
    fn jittered_backoff_is_monotone_and_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 1.0, 5);
        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for failures in 1..12 {
                let delay = policy.delay(failures);
                assert!(delay >= previous, "delay went down at attempt {failures}");
                assert!(delay <= policy.cap());
                previous = delay;
            }
        }
    }

    #[test]
    fn jitter_only_stretches_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0.2, 5);
        assert_eq!(policy.delay_with_unit(2, 0.0), Duration::from_millis(2_000));
        assert_eq!(policy.delay_with_unit(2, 0.5), Duration::from_millis(2_200));
        assert_eq!(policy.delay_with_unit(0, 0.5), Duration::ZERO);
    }

    #[test]
    fn ceiling_is_exclusive() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }
}
