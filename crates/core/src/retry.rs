use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::PendingPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryWait {
    /// The interval elapsed; issue the next attempt.
    Retry,
    /// Every attempt in the budget has been used.
    Exhausted,
    Cancelled,
}

/// Fixed-interval retry with a bounded attempt budget. Waiting yields to the
/// runtime and returns early when the run is cancelled.
#[derive(Debug, Clone)]
pub struct BoundedRetry {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl BoundedRetry {
    pub fn new(policy: &PendingPolicy) -> Self {
        Self {
            interval: policy.interval,
            max_attempts: policy.max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn wait(&mut self, cancel: &CancellationToken) -> RetryWait {
        if self.attempts >= self.max_attempts {
            return RetryWait::Exhausted;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => RetryWait::Cancelled,
            _ = tokio::time::sleep(self.interval) => {
                self.attempts += 1;
                RetryWait::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ms: u64, max_attempts: u32) -> PendingPolicy {
        PendingPolicy {
            interval: Duration::from_millis(ms),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn budget_is_exhausted_after_max_attempts() {
        let cancel = CancellationToken::new();
        let mut retry = BoundedRetry::new(&policy(1, 3));
        for _ in 0..3 {
            assert_eq!(retry.wait(&cancel).await, RetryWait::Retry);
        }
        assert_eq!(retry.wait(&cancel).await, RetryWait::Exhausted);
        assert_eq!(retry.attempts(), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let mut retry = BoundedRetry::new(&policy(60_000, 5));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        assert_eq!(retry.wait(&cancel).await, RetryWait::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(retry.attempts(), 0);
    }
}
