//! Bounded retry with exponential backoff.
//!
//! Errors opt in through [`RetryClassifiable`]; only retryable errors are
//! retried, everything else is returned after the first attempt. The whole
//! retry sequence races against a cancellation token.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;

use crate::cancel::OrCancelExt;
use crate::config::RetryConfig;

/// Classification hook for retry decisions.
pub trait RetryClassifiable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },

    #[error("permanent error: {0}")]
    Permanent(E),

    #[error("retry aborted by cancellation")]
    Cancelled,
}

/// Retry policy for a single operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            factor: config.factor as f32,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.factor)
            .with_max_times(self.max_retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// policy, or `cancel` fires. `on_retry` sees each retryable error with
    /// the delay before the next attempt.
    pub async fn run<F, Fut, T, E, N>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
        on_retry: N,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: RetryClassifiable + Send,
        N: FnMut(&E, Duration) + Send,
    {
        let mut attempts = 0usize;
        let outcome = (|| {
            attempts += 1;
            operation()
        })
        .retry(self.backoff())
        .when(|err: &E| err.is_retryable())
        .notify(on_retry)
        .or_cancel(cancel)
        .await;

        match outcome {
            Err(_) => Err(RetryError::Cancelled),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_retryable() => Err(RetryError::Exhausted {
                attempts,
                last: err,
            }),
            Ok(Err(err)) => Err(RetryError::Permanent(err)),
        }
    }
}
