use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::governor::ExecutionGovernor;
use crate::{TransferError, TransferResult};

/// What the retry policy sees after a failed attempt
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// 1-based number of the attempt that just failed
    pub attempt: u32,
    pub error: &'a TransferError,
}

/// Verdict of a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Stop,
}

/// Pluggable retry algorithm. The engine only asks it whether and when to retry;
/// the execution-time budget is enforced separately.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, ctx: &RetryContext<'_>) -> RetryDecision;
}

/// Exponential backoff for retryable errors, capped in attempts and delay
#[derive(Debug, Clone)]
pub struct ExponentialRetry {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ExponentialRetry {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ExponentialRetry {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            ..Self::default()
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl RetryPolicy for ExponentialRetry {
    fn evaluate(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        if !ctx.error.is_retryable() || ctx.attempt >= self.max_attempts {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry(self.backoff_for(ctx.attempt))
    }
}

/// Never retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn evaluate(&self, _ctx: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::Stop
    }
}

/// Failure of a retried request, with the number of attempts it took
#[derive(Debug)]
pub(crate) struct RetryFailure {
    pub attempts: u32,
    pub error: TransferError,
}

/// Run `attempt` until it succeeds, the policy gives up, or the governor refuses
/// to start another attempt.
pub(crate) async fn run_with_retry<T, F, Fut>(
    governor: &ExecutionGovernor,
    policy: &dyn RetryPolicy,
    mut attempt: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransferResult<T>>,
{
    let mut attempts = 0u32;
    loop {
        if let Err(error) = governor.begin_attempt() {
            return Err(RetryFailure { attempts, error });
        }
        attempts += 1;

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let decision = policy.evaluate(&RetryContext {
                    attempt: attempts,
                    error: &error,
                });
                match decision {
                    RetryDecision::Retry(backoff) => {
                        warn!(attempt = attempts, ?backoff, "Retrying after error: {}", error);
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                    RetryDecision::Stop => {
                        debug!(attempt = attempts, "Giving up after error: {}", error);
                        return Err(RetryFailure { attempts, error });
                    }
                }
            }
        }
    }
}

/// Retried single request; the last error is reported as-is
pub(crate) async fn run_request<T, F, Fut>(
    governor: &ExecutionGovernor,
    policy: &dyn RetryPolicy,
    attempt: F,
) -> TransferResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransferResult<T>>,
{
    run_with_retry(governor, policy, attempt).await.map_err(|failure| failure.error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> TransferError {
        TransferError::protocol(ProtocolCode::ServerBusy, "try again")
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ExponentialRetry {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        let error = busy();

        assert_eq!(
            policy.evaluate(&RetryContext { attempt: 1, error: &error }),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            policy.evaluate(&RetryContext { attempt: 3, error: &error }),
            RetryDecision::Retry(Duration::from_millis(400))
        );
        assert_eq!(
            policy.evaluate(&RetryContext { attempt: 6, error: &error }),
            RetryDecision::Retry(Duration::from_millis(500))
        );
        assert_eq!(
            policy.evaluate(&RetryContext { attempt: 10, error: &error }),
            RetryDecision::Stop
        );
    }

    #[test]
    fn permanent_errors_stop_immediately() {
        let error = TransferError::protocol(ProtocolCode::PreconditionFailed, "etag changed");
        let context = RetryContext { attempt: 1, error: &error };
        let decision = ExponentialRetry::default().evaluate(&context);
        assert_eq!(decision, RetryDecision::Stop);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let governor = ExecutionGovernor::unbounded();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = ExponentialRetry::new(5, Duration::ZERO);

        let result = run_with_retry(&governor, &policy, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(busy())
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(governor.attempts(), 3);
    }

    #[tokio::test]
    async fn reports_attempt_count_on_exhaustion() {
        let governor = ExecutionGovernor::unbounded();
        let policy = ExponentialRetry::new(2, Duration::ZERO);

        let failure = run_with_retry(&governor, &policy, || async { Err::<(), _>(busy()) })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert!(failure.error.is_retryable());
    }
}
