use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use super::StoreError;

/// Bounded retry with exponential backoff for backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retrying.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delays between attempts: `initial_delay`, doubling, capped at
    /// `max_delay`, one fewer than `max_attempts`.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        // base 2 starts at 2ms * factor, so halve to start at initial_delay
        ExponentialBackoff::from_millis(2)
            .factor(self.initial_delay.as_millis() as u64)
            .map(move |delay| (delay / 2).min(max_delay))
            .take(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Run `f` until it succeeds, fails terminally, or attempts run out.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let attempt = AtomicU32::new(0);

        RetryIf::spawn(
            self.strategy(),
            || {
                attempt.fetch_add(1, Ordering::Relaxed);
                f()
            },
            |e: &StoreError| {
                let attempt = attempt.load(Ordering::Relaxed);
                let retry = e.is_retryable() && attempt < max_attempts;
                if retry {
                    tracing::warn!(
                        op,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Backend call failed, retrying"
                    );
                }
                retry
            },
        )
        .await
    }
}
