use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    pub recovered: bool,
    pub retries_used: u32,
}

/// Fixed-interval wait for a degraded signal to come back. Every check is
/// preceded by a sleep.
#[derive(Clone)]
pub struct RetryWaiter {
    interval: Duration,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryWaiter")
            .field("interval", &self.interval)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl RetryWaiter {
    pub fn new(interval: Duration, max_retries: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            max_retries,
            clock,
        }
    }

    /// Longest time a wait can take, excluding the checks themselves.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_retries
    }

    pub async fn wait_for_recovery<F, Fut>(&self, mut check: F) -> RecoveryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut attempt = 0u32;
        while attempt < self.max_retries {
            attempt += 1;
            self.clock.sleep(self.interval).await;
            if check(attempt).await {
                return RecoveryOutcome {
                    recovered: true,
                    retries_used: attempt,
                };
            }
            debug!(attempt, max_retries = self.max_retries, "still degraded");
        }
        RecoveryOutcome {
            recovered: false,
            retries_used: attempt,
        }
    }
}
