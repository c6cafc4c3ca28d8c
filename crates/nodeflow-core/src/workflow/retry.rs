//! Retry handler with fixed, exponential, and linear backoff.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter. `attempt` is 1-based (the first execution is attempt 1);
//! the delay before attempt `n + 1` is computed from the retry index `n - 1`.

use std::future::Future;
use std::time::Duration;

use nodeflow_types::definition::{RetryPolicy, RetryStrategy};
use tokio_util::sync::CancellationToken;

use crate::node::NodeError;

/// Optional caller-supplied predicate narrowing which failures retry.
pub type RetryPredicate<'a> = dyn Fn(&NodeError) -> bool + Send + Sync + 'a;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for node failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failed `attempt` may be followed by another one.
    ///
    /// Requires a retrying strategy, remaining budget, a retryable error,
    /// a category listed in `retry_on` (when non-empty), and approval from
    /// the optional predicate.
    pub fn should_retry(
        policy: &RetryPolicy,
        attempt: u32,
        error: &NodeError,
        predicate: Option<&RetryPredicate<'_>>,
    ) -> bool {
        if policy.strategy == RetryStrategy::None || attempt >= policy.max_attempts {
            return false;
        }
        if !error.is_retryable() {
            return false;
        }
        if !policy.retry_on.is_empty() {
            let matches = error
                .category()
                .is_some_and(|c| policy.retry_on.iter().any(|r| r == c));
            if !matches {
                return false;
            }
        }
        predicate.is_none_or(|p| p(error))
    }

    /// Delay before the retry that follows `attempt`.
    pub fn delay_after(policy: &RetryPolicy, attempt: u32) -> Duration {
        let retry_index = attempt.saturating_sub(1);
        let base = policy.initial_delay_ms as f64;
        let millis = match policy.strategy {
            RetryStrategy::None => 0.0,
            RetryStrategy::Fixed => base,
            RetryStrategy::Exponential => base * policy.multiplier.powi(retry_index as i32),
            RetryStrategy::Linear => base * f64::from(retry_index + 1),
        };
        let capped = match policy.max_delay_ms {
            Some(max) => millis.min(max as f64),
            None => millis,
        };
        Duration::from_millis(capped.max(0.0).min(u64::MAX as f64) as u64)
    }

    /// Run `operation` under `policy`.
    ///
    /// `operation` receives the 1-based attempt number. `on_failure` observes
    /// every failed attempt together with the delay before the next one
    /// (`None` when no retry follows). Waits observe `cancel`.
    ///
    /// Failures that may not be retried are returned unchanged; running out
    /// of attempts after at least one retry yields `RetryExhausted`.
    pub async fn run<T, F, Fut, O>(
        policy: Option<&RetryPolicy>,
        predicate: Option<&RetryPredicate<'_>>,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_failure: O,
    ) -> Result<T, NodeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
        O: FnMut(u32, &NodeError, Option<Duration>),
    {
        let mut attempt = 1;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(policy) = policy else {
                on_failure(attempt, &error, None);
                return Err(error);
            };

            if !Self::should_retry(policy, attempt, &error, predicate) {
                on_failure(attempt, &error, None);
                let exhausted = attempt > 1
                    && attempt >= policy.max_attempts
                    && error.is_retryable();
                if exhausted {
                    return Err(NodeError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                return Err(error);
            }

            let delay = Self::delay_after(policy, attempt);
            on_failure(attempt, &error, Some(delay));
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, %error, "retrying after failure");

            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn exponential_delays_double() {
        let policy = RetryPolicy::exponential(4, 100, 2.0);
        let delays: Vec<u128> = (1..=3)
            .map(|a| RetryHandler::delay_after(&policy, a).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400]);
    }

    #[test]
    fn fixed_and_linear_delays() {
        let fixed = RetryPolicy::fixed(5, 50);
        assert_eq!(RetryHandler::delay_after(&fixed, 1).as_millis(), 50);
        assert_eq!(RetryHandler::delay_after(&fixed, 4).as_millis(), 50);

        let linear = RetryPolicy::linear(5, 100);
        let delays: Vec<u128> = (1..=3)
            .map(|a| RetryHandler::delay_after(&linear, a).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 300]);
    }

    #[test]
    fn max_delay_caps_backoff() {
        let mut policy = RetryPolicy::exponential(10, 100, 3.0);
        policy.max_delay_ms = Some(500);
        assert_eq!(RetryHandler::delay_after(&policy, 5).as_millis(), 500);
    }

    #[test]
    fn should_retry_respects_budget_and_strategy() {
        let policy = RetryPolicy::exponential(3, 10, 2.0);
        let err = NodeError::execution("boom");
        assert!(RetryHandler::should_retry(&policy, 1, &err, None));
        assert!(RetryHandler::should_retry(&policy, 2, &err, None));
        assert!(!RetryHandler::should_retry(&policy, 3, &err, None));

        let none = RetryPolicy {
            strategy: RetryStrategy::None,
            ..policy
        };
        assert!(!RetryHandler::should_retry(&none, 1, &err, None));
    }

    #[test]
    fn should_retry_filters_categories_and_predicate() {
        let mut policy = RetryPolicy::fixed(3, 10);
        policy.retry_on = vec!["network".into()];
        assert!(RetryHandler::should_retry(
            &policy,
            1,
            &NodeError::categorized("reset", "network"),
            None
        ));
        assert!(!RetryHandler::should_retry(
            &policy,
            1,
            &NodeError::categorized("bad input", "validation"),
            None
        ));
        assert!(!RetryHandler::should_retry(&policy, 1, &NodeError::Cancelled, None));

        let open = RetryPolicy::fixed(3, 10);
        let deny_all: &RetryPredicate<'_> = &|_: &NodeError| false;
        assert!(!RetryHandler::should_retry(
            &open,
            1,
            &NodeError::execution("x"),
            Some(deny_all)
        ));
    }

    #[tokio::test]
    async fn four_attempts_with_exponential_backoff() {
        let policy = RetryPolicy::exponential(4, 100, 2.0);
        let cancel = CancellationToken::new();
        let starts = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::new(Mutex::new(Vec::new()));

        let result: Result<(), NodeError> = RetryHandler::run(
            Some(&policy),
            None,
            &cancel,
            |_attempt| {
                let starts = starts.clone();
                async move {
                    starts.lock().unwrap().push(Instant::now());
                    Err(NodeError::execution("always fails"))
                }
            },
            |_, _, delay| observed.lock().unwrap().push(delay),
        )
        .await;

        match result {
            Err(NodeError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(last.to_string().contains("always fails"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 4);
        let gaps: Vec<u128> = starts
            .windows(2)
            .map(|w| w[1].duration_since(w[0]).as_millis())
            .collect();
        for (gap, expected) in gaps.iter().zip([100u128, 200, 400]) {
            assert!(
                *gap >= expected && *gap < expected + 150,
                "gap {gap}ms outside tolerance for {expected}ms"
            );
        }

        let observed = observed.lock().unwrap();
        assert_eq!(
            *observed,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(400)),
                None
            ]
        );
    }

    #[tokio::test]
    async fn success_after_retry_returns_value() {
        let policy = RetryPolicy::fixed(3, 1);
        let cancel = CancellationToken::new();
        let result = RetryHandler::run(
            Some(&policy),
            None,
            &cancel,
            |attempt| async move {
                if attempt < 2 {
                    Err(NodeError::execution("flaky"))
                } else {
                    Ok(attempt)
                }
            },
            |_, _, _| {},
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn non_matching_failure_fails_immediately() {
        let mut policy = RetryPolicy::fixed(5, 1);
        policy.retry_on = vec!["network".into()];
        let cancel = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0u32));

        let result: Result<(), NodeError> = RetryHandler::run(
            Some(&policy),
            None,
            &cancel,
            |_| {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err(NodeError::categorized("bad payload", "validation"))
                }
            },
            |_, _, _| {},
        )
        .await;

        assert!(matches!(result, Err(NodeError::Execution { .. })));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::fixed(3, 10_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), NodeError> = RetryHandler::run(
            Some(&policy),
            None,
            &cancel,
            |_| async { Err(NodeError::execution("down")) },
            |_, _, _| {},
        )
        .await;

        assert!(matches!(result, Err(NodeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn no_policy_means_single_attempt() {
        let cancel = CancellationToken::new();
        let result: Result<(), NodeError> = RetryHandler::run(
            None,
            None,
            &cancel,
            |_| async { Err(NodeError::execution("once")) },
            |_, _, _| {},
        )
        .await;
        assert!(matches!(result, Err(NodeError::Execution { .. })));
    }
}
