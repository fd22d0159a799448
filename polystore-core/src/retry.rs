//! Exponential-backoff retry for transient backend failures.
//!
//! Classification looks at the error kind first, then falls back to a
//! locale-tolerant keyword scan of the message so one policy covers
//! heterogeneous drivers without per-driver branching at call sites.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::{DalResult, DataAccessError};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(2000);

/// Whether an operation can be safely re-executed after a timeout.
///
/// Timeouts are only retried for idempotent work; a write that may have
/// been applied must not be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

/// Engine-agnostic exponential-backoff executor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Policy that never retries; useful inside transactions.
    pub fn none() -> Self {
        Self::new(0, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before the given retry (1-based):
    /// `min(initial_delay * 2^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = (self.initial_delay.as_millis() as u64).saturating_mul(1 << shift);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Blocking form of [`execute`](Self::execute) for callers outside
    /// the runtime (startup paths, CLIs). Sleeps on the current thread.
    pub fn execute_sync<T, F>(
        &self,
        name: &str,
        idempotency: Idempotency,
        mut operation: F,
    ) -> DalResult<T>
    where
        F: FnMut() -> DalResult<T>,
    {
        let mut attempt = 0u32;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && is_retryable(&err, idempotency) => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run `operation`, retrying classified-transient failures up to
    /// `max_retries` times. Exhaustion returns the original error
    /// unchanged so callers see the root cause.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        idempotency: Idempotency,
        mut operation: F,
    ) -> DalResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DalResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && is_retryable(&err, idempotency) => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Kind-first classification with a message fallback for unclassified
/// backend errors.
pub fn is_retryable(err: &DataAccessError, idempotency: Idempotency) -> bool {
    match err {
        DataAccessError::Connection { .. } | DataAccessError::TransientConflict { .. } => true,
        DataAccessError::Timeout { .. } => idempotency == Idempotency::Idempotent,
        DataAccessError::Backend { reason, .. } => looks_transient(reason),
        DataAccessError::Configuration { .. } | DataAccessError::Validation { .. } => false,
    }
}

/// Keyword scan over a driver message. Keyword lists cover English plus
/// the CJK terms emitted by localized driver builds; revisit them when a
/// driver is upgraded.
pub fn looks_transient(message: &str) -> bool {
    let lower = message.to_lowercase();

    const CONNECTION: &[&str] = &["connection", "connect", "连接", "无法连接"];
    const TIMEOUT: &[&str] = &["timeout", "timed out", "超时"];
    const DEADLOCK: &[&str] = &["deadlock", "dead lock", "死锁"];
    const RESOURCE: &[&str] = &["resource", "资源"];

    [CONNECTION, TIMEOUT, DEADLOCK, RESOURCE]
        .iter()
        .any(|group| group.iter().any(|kw| lower.contains(kw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_sequence_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(2000));
    }

    #[test]
    fn classification_by_kind() {
        let idem = Idempotency::Idempotent;
        assert!(is_retryable(&DataAccessError::connection("gone"), idem));
        assert!(is_retryable(&DataAccessError::transient("deadlock"), idem));
        assert!(!is_retryable(&DataAccessError::validation("bad"), idem));
        assert!(!is_retryable(&DataAccessError::configuration("bad"), idem));

        let timeout = DataAccessError::timeout("get_all", Duration::from_secs(1));
        assert!(is_retryable(&timeout, Idempotency::Idempotent));
        assert!(!is_retryable(&timeout, Idempotency::NonIdempotent));
    }

    #[test]
    fn keyword_fallback_is_locale_tolerant() {
        assert!(looks_transient("Connection refused"));
        assert!(looks_transient("query timed out"));
        assert!(looks_transient("检测到死锁"));
        assert!(looks_transient("资源不足"));
        assert!(!looks_transient("syntax error near SELECT"));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let started = tokio::time::Instant::now();
        let calls_in = Arc::clone(&calls);
        let result = policy
            .execute("op", Idempotency::Idempotent, move || {
                let calls = Arc::clone(&calls_in);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DataAccessError::connection("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // two delayed retries: 100ms then 200ms, deterministic under the
        // paused clock
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn sync_form_retries_and_propagates() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        let mut calls = 0u32;
        let result = policy.execute_sync("op", Idempotency::Idempotent, || {
            calls += 1;
            if calls < 2 {
                Err(DataAccessError::transient("conflict"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_original_error() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: DalResult<()> = policy
            .execute("op", Idempotency::Idempotent, move || {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DataAccessError::connection("still down"))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, DataAccessError::Connection { .. }));
        assert!(err.to_string().contains("still down"));
        // original call + max_retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: DalResult<()> = policy
            .execute("op", Idempotency::Idempotent, move || {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DataAccessError::validation("bad filter"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
