use crate::errors::ErrorKind;
use std::time::Duration;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// How backoff delay is randomized before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterMode {
    /// No jitter; always use the computed delay.
    None,
    /// Uniform random delay in `[0, computed]`.
    Full,
    /// Uniform random multiplier in `[0.5, 1.5]` applied to the computed delay. Default.
    #[default]
    Proportional,
}

/// Exponential backoff policy with attempt cap, matching §4.6's retry timing:
/// `next_eligible_at = now + min(base * 2^(attempt-1), max_delay)`, then jittered.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
    /// Jitter applied to the computed delay.
    pub jitter: JitterMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: JitterMode::Proportional,
        }
    }
}

impl RetryPolicy {
    /// Compute the next backoff delay for a given attempt and error kind.
    ///
    /// `attempt` is 1-based (1 = first attempt, already failed). Returns
    /// `RetryDecision::NoRetry` once `attempt >= max_attempts` or the error
    /// kind is terminal.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts || !kind.is_retryable() {
            return RetryDecision::NoRetry;
        }
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        let raw = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(self.apply_jitter(raw))
    }

    /// Same as `decide`, but honors a server-supplied `Retry-After` hint
    /// (HTTP 429) when it is larger than the computed backoff, per the
    /// boundary behavior in §8.
    pub fn decide_with_retry_after(
        &self,
        attempt: u32,
        kind: ErrorKind,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        match self.decide(attempt, kind) {
            RetryDecision::NoRetry => RetryDecision::NoRetry,
            RetryDecision::RetryAfter(computed) => match retry_after {
                Some(hint) if hint > computed => RetryDecision::RetryAfter(hint),
                _ => RetryDecision::RetryAfter(computed),
            },
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        match self.jitter {
            JitterMode::None => delay,
            JitterMode::Full => delay.mul_f64(fastrand_unit()),
            JitterMode::Proportional => delay.mul_f64(0.5 + fastrand_unit()),
        }
    }
}

/// Uniform random value in `[0, 1)` without pulling in a dedicated RNG crate;
/// seeded from the thread-local address and the current instant, which is
/// adequate for jitter (not security-sensitive).
fn fastrand_unit() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1_000_000) as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_for_terminal_kind() {
        let p = RetryPolicy {
            jitter: JitterMode::None,
            ..RetryPolicy::default()
        };
        assert_eq!(p.decide(1, ErrorKind::Http4xxOther), RetryDecision::NoRetry);
    }

    #[test]
    fn checksum_mismatch_never_retries() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::ChecksumMismatch), RetryDecision::NoRetry);
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let p = RetryPolicy {
            max_attempts: 20,
            jitter: JitterMode::None,
            ..RetryPolicy::default()
        };
        let d1 = match p.decide(1, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        let d2 = match p.decide(2, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        assert!(d2 >= d1);

        let d_last = match p.decide(10, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        assert!(d_last <= p.max_delay);
    }

    #[test]
    fn respects_max_attempts() {
        let p = RetryPolicy {
            max_attempts: 3,
            jitter: JitterMode::None,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            p.decide(1, ErrorKind::Http429),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            p.decide(2, ErrorKind::Http429),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(p.decide(3, ErrorKind::Http429), RetryDecision::NoRetry);
    }

    #[test]
    fn retry_after_hint_overrides_smaller_computed_delay() {
        let p = RetryPolicy {
            jitter: JitterMode::None,
            base_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        let d = p.decide_with_retry_after(1, ErrorKind::Http429, Some(Duration::from_secs(5)));
        assert_eq!(d, RetryDecision::RetryAfter(Duration::from_secs(5)));
    }

    #[test]
    fn retry_after_hint_smaller_than_computed_is_ignored() {
        let p = RetryPolicy {
            jitter: JitterMode::None,
            base_delay: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        let d = p.decide_with_retry_after(1, ErrorKind::Http429, Some(Duration::from_millis(1)));
        assert_eq!(d, RetryDecision::RetryAfter(Duration::from_secs(5)));
    }
}
