//! Per-stage timeouts, the overall assembly deadline, and cancellation.

use std::future::Future;
use std::time::Duration;

use qcc_core::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a guarded call did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The stage's own timeout elapsed.
    Timeout(Duration),
    Cancelled,
    /// The overall deadline elapsed first.
    Deadline,
}

/// Bounds every suspension point of one assembly.
#[derive(Debug, Clone)]
pub struct StageGuard {
    token: CancellationToken,
    deadline: Instant,
    budget: Duration,
}

impl StageGuard {
    pub fn new(token: CancellationToken, budget: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + budget,
            budget,
        }
    }

    /// A guard that is never cancelled and has no overall deadline. Used for rollback and release.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), Duration::from_secs(365 * 24 * 3600))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Fail fast between stages.
    pub fn check(&self) -> qcc_core::Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.remaining().is_zero() {
            return Err(Error::DeadlineExceeded(self.budget_ms()));
        }
        Ok(())
    }

    /// Run `fut` bounded by `limit`, the overall deadline, and cancellation.
    pub async fn run<F: Future>(&self, limit: Duration, fut: F) -> Result<F::Output, Interrupt> {
        let remaining = self.remaining();
        let (limit, on_elapsed) = if limit <= remaining {
            (limit, Interrupt::Timeout(limit))
        } else {
            (remaining, Interrupt::Deadline)
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            res = tokio::time::timeout(limit, fut) => res.map_err(|_| on_elapsed),
        }
    }

    /// Run `fut` bounded only by the overall deadline and cancellation.
    pub async fn watch<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        let remaining = self.remaining();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            res = tokio::time::timeout(remaining, fut) => res.map_err(|_| Interrupt::Deadline),
        }
    }

    /// Map an interrupt of `operation` to the assembly error it surfaces as.
    pub fn error(&self, interrupt: Interrupt, operation: &str) -> Error {
        match interrupt {
            Interrupt::Cancelled => Error::Cancelled,
            Interrupt::Deadline => Error::DeadlineExceeded(self.budget_ms()),
            Interrupt::Timeout(limit) => {
                Error::Internal(format!("{} timed out after {}ms", operation, limit.as_millis()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_timeout_vs_deadline() {
        let guard = StageGuard::new(CancellationToken::new(), Duration::from_secs(10));
        let res = guard
            .run(Duration::from_millis(10), tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(res, Err(Interrupt::Timeout(Duration::from_millis(10))));

        let guard = StageGuard::new(CancellationToken::new(), Duration::from_millis(10));
        let res = guard
            .run(Duration::from_secs(5), tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(res, Err(Interrupt::Deadline));
        assert!(matches!(guard.check(), Err(Error::DeadlineExceeded(10))));
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let token = CancellationToken::new();
        let guard = StageGuard::new(token.clone(), Duration::from_secs(10));
        token.cancel();
        let res = guard.watch(async { 1 }).await;
        assert_eq!(res, Err(Interrupt::Cancelled));
        assert!(matches!(guard.check(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_completes_within_bounds() {
        let guard = StageGuard::new(CancellationToken::new(), Duration::from_secs(10));
        assert_eq!(guard.run(Duration::from_secs(1), async { 7 }).await, Ok(7));
        assert!(guard.check().is_ok());
    }
}
