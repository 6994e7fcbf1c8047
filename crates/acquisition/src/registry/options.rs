//! Per-call deadline and cancellation for suspension points.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-supplied bounds for one acquisition.
///
/// Both bounds apply to suspension points (backoff and rate-limit waits) and
/// to starting new provider attempts. An adapter call already in flight runs
/// under the shorter of its own timeout and the time left to the deadline.
#[derive(Clone, Debug, Default)]
pub struct AcquireOptions {
    /// Absolute deadline for the whole fallback chain.
    pub deadline: Option<Instant>,
    /// Token checked before each attempt and raced against each wait.
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Why no further attempt may start, if any.
    pub fn interrupted(&self) -> Option<WaitInterrupted> {
        if self
            .cancel
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
        {
            return Some(WaitInterrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(WaitInterrupted::DeadlineExceeded),
            _ => None,
        }
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitInterrupted {
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Sleep for `duration` unless the deadline or cancellation token fires first.
///
/// A wait that would run past the deadline fails immediately instead of
/// sleeping up to it.
pub(crate) async fn interruptible_sleep(
    duration: Duration,
    options: &AcquireOptions,
) -> Result<(), WaitInterrupted> {
    if let Some(reason) = options.interrupted() {
        return Err(reason);
    }
    if duration.is_zero() {
        return Ok(());
    }
    if let Some(remaining) = options.remaining() {
        if duration > remaining {
            return Err(WaitInterrupted::DeadlineExceeded);
        }
    }

    match &options.cancel {
        Some(token) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = token.cancelled() => Err(WaitInterrupted::Cancelled),
            }
        }
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_bounds() {
        let start = Instant::now();
        interruptible_sleep(Duration::from_secs(30), &AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_past_deadline_fails_fast() {
        let options = AcquireOptions::with_timeout(Duration::from_secs(10));
        let start = Instant::now();
        let result = interruptible_sleep(Duration::from_secs(30), &options).await;
        assert_eq!(result, Err(WaitInterrupted::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let options = AcquireOptions::default().with_cancel(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let start = Instant::now();
        let result = interruptible_sleep(Duration::from_secs(60), &options).await;
        assert_eq!(result, Err(WaitInterrupted::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        canceller.await.unwrap();
    }

    #[test]
    fn test_cancelled_token_reports_interrupted() {
        let token = CancellationToken::new();
        token.cancel();
        let options = AcquireOptions::default().with_cancel(token);
        assert_eq!(options.interrupted(), Some(WaitInterrupted::Cancelled));
    }
}
