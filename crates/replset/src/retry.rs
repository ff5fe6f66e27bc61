//! Bounded retry driver
//!
//! An [`AttemptStrategy`] bounds attempts by total elapsed time and/or by a
//! minimum attempt count. The first attempt is always granted, so a zero
//! budget still gets one try.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry budget: keep going for `total`, sleeping `delay` between attempts,
/// and make at least `min` attempts regardless of the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStrategy {
    pub total: Duration,
    pub delay: Duration,
    pub min: usize,
}

impl AttemptStrategy {
    /// Time-bounded strategy
    pub fn new(total: Duration, delay: Duration) -> Self {
        Self { total, delay, min: 0 }
    }

    /// Count-bounded strategy: exactly `attempts` tries, `delay` apart.
    pub fn attempts(attempts: usize, delay: Duration) -> Self {
        Self {
            total: Duration::ZERO,
            delay,
            min: attempts,
        }
    }

    /// Start the clock
    pub fn start(&self) -> Attempt {
        let now = Instant::now();
        Attempt {
            strategy: *self,
            start: now,
            end: now.checked_add(self.total),
            count: 0,
        }
    }
}

impl Default for AttemptStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(120), Duration::from_millis(500))
    }
}

/// A running [`AttemptStrategy`]
#[derive(Debug)]
pub struct Attempt {
    strategy: AttemptStrategy,
    start: Instant,
    /// `None` when the budget reaches past what `Instant` can represent
    end: Option<Instant>,
    count: usize,
}

impl Attempt {
    /// Wait for the next attempt. Returns false once the budget is spent.
    pub async fn next(&mut self) -> bool {
        if self.count == 0 {
            self.count = 1;
            return true;
        }
        if !self.has_next() {
            return false;
        }
        tokio::time::sleep(self.strategy.delay).await;
        self.count += 1;
        true
    }

    /// Whether another attempt would be granted.
    pub fn has_next(&self) -> bool {
        if self.count == 0 || self.count < self.strategy.min {
            return true;
        }
        match self.end {
            Some(end) => Instant::now()
                .checked_add(self.strategy.delay)
                .map_or(false, |next| next < end),
            None => true,
        }
    }

    /// Attempts made so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Time since the strategy was started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Run `f` until it succeeds or the strategy is exhausted.
///
/// Failures are logged; the last error is returned unchanged.
pub async fn retry<T, F, Fut>(strategy: AttemptStrategy, description: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = strategy.start();
    loop {
        // The first call to next() always succeeds.
        attempt.next().await;
        match f().await {
            Ok(value) => {
                tracing::debug!(
                    "{}: {} attempts in {:?}",
                    description,
                    attempt.count(),
                    attempt.elapsed()
                );
                return Ok(value);
            }
            Err(err) if attempt.has_next() && err.is_retryable() => {
                tracing::debug!("{} failed: {}", description, err);
            }
            Err(err) => {
                tracing::warn!(
                    "{} gave up after {} attempts in {:?}: {}",
                    description,
                    attempt.count(),
                    attempt.elapsed(),
                    err
                );
                return Err(err);
            }
        }
    }
}
