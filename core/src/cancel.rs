//! Cancellation helpers shared by simulation tasks and the reconciler.
//!
//! Every suspension point in the engine (pacing waits, retry backoff, the
//! poll interval) races against a `CancellationToken` so shutdown and
//! proactive task cancellation take effect promptly.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Returned when the token fired before the future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Race a future against a cancellation token.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `duration` unless the token fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    token: &CancellationToken,
) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        return Err(Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::time::sleep(duration).or_cancel(token).await
}
