//! Doubling retry delays for the range loops and the startup head probe.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Ceiling for the delay between retries of a failed block range.
pub(crate) const RANGE_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Delay that doubles on every consecutive failure up to a ceiling and
/// returns to its initial value on [`Backoff::reset`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
    failures: usize,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(initial);
        Self {
            initial,
            ceiling,
            current: initial,
            failures: 0,
        }
    }

    /// Range loop backoff: starts at `initial` and stops growing at
    /// [`RANGE_RETRY_MAX_DELAY`].
    pub(crate) fn for_ranges(initial: Duration) -> Self {
        Self::new(initial, RANGE_RETRY_MAX_DELAY)
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures
    }

    /// Delay the next [`Backoff::wait`] sleeps for.
    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.failures += 1;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Records a failure and sleeps for the current delay. Errors when
    /// `token` is cancelled before the delay elapses.
    pub(crate) async fn wait(&mut self, token: &CancellationToken) -> Result<Duration> {
        let delay = self.advance();
        if delay.is_zero() {
            yield_now().await;
        } else {
            tokio::select! {
                _ = token.cancelled() => return Err(anyhow!("retry cancelled")),
                _ = sleep(delay) => {}
            }
        }
        Ok(delay)
    }
}

/// Runs `operation` up to `max_attempts` times, waiting on `backoff` between
/// attempts. `on_retry` sees every failure together with the upcoming delay
/// and whether another attempt follows.
pub(crate) async fn retry_with_backoff<T, F, Fut, L>(
    mut backoff: Backoff,
    max_attempts: usize,
    token: &CancellationToken,
    mut operation: F,
    mut on_retry: L,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if token.is_cancelled() {
            return Err(anyhow!("retry cancelled"));
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let will_retry = attempt < max_attempts;
        on_retry(attempt, backoff.current(), &err, will_retry);
        if !will_retry {
            return Err(err);
        }
        backoff.wait(token).await?;
    }
}
