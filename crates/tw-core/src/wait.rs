//! Deadline-aware wait primitive.
//!
//! Polls an async probe with capped exponential backoff until it produces a
//! value or the deadline passes. Timing out is a distinct, non-error outcome:
//! callers that are waiting for browser state to materialize (e.g. a normal
//! window during startup) must be able to defer rather than fail.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::Result;

/// Polling behavior for [`wait_for`].
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// First poll interval; doubled after each miss.
    pub poll_initial: Duration,
    /// Backoff cap.
    pub poll_max: Duration,
    /// Hard cap on probe invocations regardless of the deadline.
    pub max_polls: usize,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_millis(100),
            poll_max: Duration::from_millis(500),
            max_polls: 50,
        }
    }
}

/// Outcome of a bounded wait.
#[derive(Debug)]
pub enum WaitOutcome<T> {
    /// The probe produced a value.
    Ready {
        value: T,
        elapsed_ms: u64,
        polls: usize,
    },
    /// Deadline or poll budget exhausted without a value.
    TimedOut { elapsed_ms: u64, polls: usize },
}

impl<T> WaitOutcome<T> {
    /// Extract the value if ready.
    pub fn into_ready(self) -> Option<T> {
        match self {
            Self::Ready { value, .. } => Some(value),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Poll `probe` until it returns `Some`, the deadline passes, or the poll
/// budget is spent. Probe errors propagate immediately.
pub async fn wait_for<T, F, Fut>(
    mut probe: F,
    timeout: Duration,
    options: WaitOptions,
) -> Result<WaitOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut interval = options.poll_initial;
    let mut polls = 0usize;

    loop {
        polls += 1;
        if let Some(value) = probe().await? {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            tracing::debug!(elapsed_ms, polls, "wait_for ready");
            return Ok(WaitOutcome::Ready {
                value,
                elapsed_ms,
                polls,
            });
        }

        let now = Instant::now();
        if now >= deadline || polls >= options.max_polls {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            tracing::debug!(elapsed_ms, polls, "wait_for timed out");
            return Ok(WaitOutcome::TimedOut { elapsed_ms, polls });
        }

        let remaining = deadline.saturating_duration_since(now);
        sleep(interval.min(remaining)).await;
        interval = (interval * 2).min(options.poll_max);
    }
}
