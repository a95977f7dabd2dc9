use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{TransferError, TransferResult};

/// Wall-clock budget for one logical operation.
///
/// Every network attempt of the operation (any chunk, the commit, first tries
/// and retries alike) must be admitted through [`ExecutionGovernor::begin_attempt`].
/// Attempts already in flight are never interrupted.
#[derive(Debug)]
pub struct ExecutionGovernor {
    started: Instant,
    budget: Option<Duration>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    attempts: AtomicU32,
}

impl ExecutionGovernor {
    /// Start the clock for an operation with an optional budget
    pub fn new(budget: Option<Duration>, cancellation: CancellationToken) -> Self {
        let started = Instant::now();
        Self {
            started,
            budget,
            deadline: budget.map(|b| started + b),
            cancellation,
            attempts: AtomicU32::new(0),
        }
    }

    /// Governor with no deadline and no external cancellation
    pub fn unbounded() -> Self {
        Self::new(None, CancellationToken::new())
    }

    /// Check the deadline and cancellation signal without admitting an attempt
    pub fn check(&self) -> TransferResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(TransferError::Canceled);
        }
        if let (Some(deadline), Some(budget)) = (self.deadline, self.budget) {
            if Instant::now() >= deadline {
                let attempts = self.attempts();
                warn!(?budget, attempts, "Execution time budget exhausted");
                return Err(TransferError::Timeout { budget, attempts });
            }
        }
        Ok(())
    }

    /// Admit one more network attempt, returning its 1-based number
    pub fn begin_attempt(&self) -> TransferResult<u32> {
        self.check()?;
        Ok(self.attempts.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Attempts admitted so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn refuses_attempts_after_deadline() {
        let budget = Some(Duration::from_secs(1));
        let governor = ExecutionGovernor::new(budget, CancellationToken::new());

        assert_eq!(governor.begin_attempt().unwrap(), 1);
        tokio::time::advance(Duration::from_millis(1500)).await;

        let err = governor.begin_attempt().unwrap_err();
        assert!(matches!(err, TransferError::Timeout { attempts: 1, .. }));
        assert_eq!(governor.attempts(), 1);
        assert_eq!(governor.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn cancellation_is_checked_at_the_same_point() {
        let token = CancellationToken::new();
        let governor = ExecutionGovernor::new(None, token.clone());

        assert!(governor.begin_attempt().is_ok());
        token.cancel();
        assert!(matches!(governor.begin_attempt(), Err(TransferError::Canceled)));
    }

    #[test]
    fn unbounded_never_times_out() {
        let governor = ExecutionGovernor::unbounded();
        for _ in 0..100 {
            governor.begin_attempt().unwrap();
        }
        assert_eq!(governor.attempts(), 100);
        assert_eq!(governor.remaining(), None);
    }
}
