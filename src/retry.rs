//! Retry eligibility and exponential backoff
//!
//! Eligibility is decided by error kind, never by call site. Delays grow as
//! `base * 2^attempt` and saturate at a cap.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorKind, Result, SyncError};

/// Exponent ceiling; 2^20 times any sane base already exceeds every cap
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Which errors a caller is willing to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Single attempt
    None,
    /// Network errors and 5xx
    #[default]
    Standard,
    /// Standard plus 401
    IncludeAuth,
}

/// Decide whether `error` may be retried under `policy`
pub fn should_retry(error: &SyncError, policy: RetryPolicy) -> bool {
    match policy {
        RetryPolicy::None => false,
        RetryPolicy::Standard => matches!(error.kind(), ErrorKind::Network | ErrorKind::Server),
        RetryPolicy::IncludeAuth => matches!(
            error.kind(),
            ErrorKind::Network | ErrorKind::Server | ErrorKind::Auth
        ),
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    /// Create a backoff; a cap below the base is raised to the base
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Backend API calls: 1s doubling, capped at 60s
    pub fn api() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Real-time reconnects: 5s doubling, capped at 60s
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }

    /// Offline queue rescheduling: 5s doubling, capped at 60s
    pub fn queue() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }

    /// No waiting at all; useful for tests and tight loops
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Set the jitter factor (0.0 = none, 1.0 = up to 100% extra)
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = factor.clamp(0.0, 1.0);
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Deterministic delay for a zero-based attempt: `min(base * 2^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let multiplier = 2_u64.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT));
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }

    /// `delay` plus random jitter, never exceeding the cap
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
        (delay + Duration::from_secs_f64(extra)).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::api()
    }
}

/// Stateful walk along a backoff sequence
#[derive(Debug, Clone)]
pub struct BackoffState {
    backoff: Backoff,
    attempt: u32,
}

impl BackoffState {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            attempt: 0,
        }
    }

    /// Delay to wait now; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay the next call to `next_delay` will return
    pub fn peek(&self) -> Duration {
        self.backoff.delay(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` up to `max_attempts` times, sleeping `backoff.delay(attempt)`
/// between attempts. Errors `policy` does not allow to retry are returned
/// immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    backoff: Backoff,
    max_attempts: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = if policy == RetryPolicy::None {
        1
    } else {
        max_attempts.max(1)
    };

    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !should_retry(&e, policy) || attempt + 1 >= max_attempts {
                    return Err(e);
                }
                let delay = backoff.jittered_delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_sequence() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_reconnect_sequence_and_reset() {
        let mut state = BackoffState::new(Backoff::reconnect());
        let delays: Vec<u64> = (0..6).map(|_| state.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);

        state.reset();
        assert_eq!(state.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::api();
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let backoff = Backoff::api().with_jitter(1.0);
        for attempt in 0..10 {
            let d = backoff.jittered_delay(attempt);
            assert!(d >= backoff.delay(attempt));
            assert!(d <= backoff.max());
        }
    }

    #[test]
    fn test_should_retry_matrix() {
        let network = SyncError::Network("offline".into());
        let server = SyncError::from_status(502, "");
        let auth = SyncError::from_status(401, "");
        let validation = SyncError::from_status(400, "");

        assert!(!should_retry(&network, RetryPolicy::None));
        assert!(should_retry(&network, RetryPolicy::Standard));
        assert!(should_retry(&server, RetryPolicy::Standard));
        assert!(!should_retry(&auth, RetryPolicy::Standard));
        assert!(should_retry(&auth, RetryPolicy::IncludeAuth));
        assert!(!should_retry(&validation, RetryPolicy::IncludeAuth));
        assert!(!should_retry(&SyncError::QuotaExceeded, RetryPolicy::IncludeAuth));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(RetryPolicy::Standard, Backoff::immediate(), 3, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::Network("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_first_time() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            retry_with_backoff(RetryPolicy::Standard, Backoff::immediate(), 3, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::from_status(422, "bad field")) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Validation { code: 422, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_policy_none_is_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(RetryPolicy::None, Backoff::immediate(), 5, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Network("down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
