//! Fixed-delay polling with a bounded budget

use super::ReadinessState;
use crate::error::{E2eError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long and how often to poll a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts
    pub delay: Duration,
    /// Total wall-clock time allowed
    pub budget: Duration,
    /// Stop after this many attempts even if budget remains
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Poll every `delay` for at most `budget`
    pub const fn fixed(delay: Duration, budget: Duration) -> Self {
        Self {
            delay,
            budget,
            max_attempts: None,
        }
    }

    /// Budget for a single leader election check
    pub const fn leader_check() -> Self {
        Self::fixed(Duration::from_secs(5), Duration::from_secs(5 * 60))
    }

    /// Budget for a whole cluster to become ready after install
    pub const fn readiness() -> Self {
        Self::fixed(Duration::from_secs(5), Duration::from_secs(45 * 60))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The same policy with its budget cut down to `remaining`
    pub fn capped_at(mut self, remaining: Duration) -> Self {
        self.budget = self.budget.min(remaining);
        self
    }
}

/// Outcome of one poll that did not succeed
#[derive(Debug)]
pub enum CondCheckError {
    /// Not there yet; poll again
    NotYet,
    /// Broken; stop polling
    Failed(E2eError),
}

impl From<E2eError> for CondCheckError {
    fn from(err: E2eError) -> Self {
        CondCheckError::Failed(err)
    }
}

/// Poll `cond` until it succeeds, fails, or the policy runs out.
///
/// Running out yields [`E2eError::ReadinessTimeout`] tagged with `state`.
pub async fn wait_for_condition<T, F, Fut>(
    policy: &RetryPolicy,
    state: ReadinessState,
    mut cond: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, CondCheckError>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match cond().await {
            Ok(value) => return Ok(value),
            Err(CondCheckError::Failed(err)) => return Err(err),
            Err(CondCheckError::NotYet) => {}
        }

        let elapsed = start.elapsed();
        let out_of_attempts = policy.max_attempts.is_some_and(|max| attempts >= max);
        if out_of_attempts || elapsed >= policy.budget {
            warn!(
                state = %state,
                attempts,
                "Gave up after {:?}",
                elapsed
            );
            return Err(E2eError::ReadinessTimeout { state, elapsed });
        }

        debug!(state = %state, attempts, "Condition not met yet, retrying");
        tokio::time::sleep(policy.delay.min(policy.budget - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(1), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let state = ReadinessState::WaitingForConsensus;
        let value = wait_for_condition(&quick(), state, || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CondCheckError::NotYet)
            } else {
                Ok("leader")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "leader");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out_with_state() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), Duration::from_millis(10));
        let err = wait_for_condition::<(), _, _>(&policy, ReadinessState::WaitingForHttp, || async {
            Err(CondCheckError::NotYet)
        })
        .await
        .unwrap_err();

        match err {
            E2eError::ReadinessTimeout { state, elapsed } => {
                assert_eq!(state, ReadinessState::WaitingForHttp);
                assert!(elapsed >= Duration::from_millis(10));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let state = ReadinessState::WaitingForConsensus;
        let err = wait_for_condition::<(), _, _>(&quick(), state, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CondCheckError::Failed(E2eError::Internal("broken".to_string())))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, E2eError::Internal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy =
            RetryPolicy::fixed(Duration::ZERO, Duration::from_secs(60)).with_max_attempts(4);
        let state = ReadinessState::WaitingForBuildManifest;
        let err = wait_for_condition::<(), _, _>(&policy, state, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CondCheckError::NotYet)
        })
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_capped_at() {
        let policy = RetryPolicy::leader_check().capped_at(Duration::from_secs(30));
        assert_eq!(policy.budget, Duration::from_secs(30));
        assert_eq!(policy.delay, Duration::from_secs(5));
        let untouched = RetryPolicy::leader_check().capped_at(Duration::from_secs(3600));
        assert_eq!(untouched.budget, Duration::from_secs(300));
    }
}
