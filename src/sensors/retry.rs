//! Bounded exponential backoff with a cancellable wait.
//!
//! One [`BackoffRetrier::run`] call is one backoff episode: the action is
//! tried, and on failure retried after `initial_delay`, `2 * initial_delay`,
//! `4 * initial_delay`, ... until it succeeds, the budget runs out, or the
//! episode is cancelled.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Retry budget for one backoff episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_attempts: u32,
    /// Wait before the first retry
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    /// Policy used to recover a session after the link drops.
    pub fn session_recovery() -> Self {
        Self::new(3, Duration::from_secs(2))
    }

    /// The full sequence of waits this policy allows.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let mut budget = RetryBudget::new(*self);
        std::iter::from_fn(move || budget.consume())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::session_recovery()
    }
}

/// Remaining budget inside an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Retries still allowed
    pub attempts_remaining: u32,
    /// Wait before the next retry
    pub next_delay: Duration,
}

impl RetryBudget {
    /// Fresh budget for a policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts_remaining: policy.max_attempts,
            next_delay: policy.initial_delay,
        }
    }

    /// Take one retry, returning how long to wait before it.
    pub fn consume(&mut self) -> Option<Duration> {
        if self.attempts_remaining == 0 {
            return None;
        }
        let delay = self.next_delay;
        self.next_delay = self.next_delay.saturating_mul(2);
        self.attempts_remaining -= 1;
        Some(delay)
    }
}

/// Cancellation signal shared between an episode and its owner.
///
/// Once cancelled, stays cancelled. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel every waiter, now and in the future.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender lives as long as self
            std::future::pending::<()>().await;
        }
    }

    /// Drive `future` unless the token is cancelled first.
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = future => Some(output),
        }
    }
}

/// How an episode ended without success.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// The episode was cancelled
    #[error("Retry cancelled")]
    Cancelled,
}

/// A retry about to be scheduled, handed to the observer.
#[derive(Debug)]
pub struct PendingRetry<'a, E> {
    /// Error from the attempt that just failed
    pub error: &'a E,
    /// Wait before the next attempt
    pub delay: Duration,
    /// Retries left after this one
    pub attempts_remaining: u32,
}

/// Drives an action through a bounded backoff episode.
#[derive(Debug, Clone, Copy)]
pub struct BackoffRetrier {
    policy: RetryPolicy,
}

impl BackoffRetrier {
    /// Create a retrier for a policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this retrier runs.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `action` until it succeeds, the budget runs out, or `cancel` fires.
    pub async fn run<T, E, F, Fut>(
        &self,
        action: F,
        cancel: &CancelToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_observed(action, cancel, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry` before every wait.
    pub async fn run_observed<T, E, F, Fut, O>(
        &self,
        mut action: F,
        cancel: &CancelToken,
        mut on_retry: O,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        O: FnMut(&PendingRetry<'_, E>),
    {
        let mut budget = RetryBudget::new(self.policy);
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            attempts += 1;
            let error = match cancel.run_until_cancelled(action()).await {
                None => return Err(RetryError::Cancelled),
                Some(Ok(value)) => return Ok(value),
                Some(Err(error)) => error,
            };

            let tries_left = budget.attempts_remaining;
            let Some(delay) = budget.consume() else {
                tracing::error!("Giving up after {} attempts: {}", attempts, error);
                return Err(RetryError::Exhausted {
                    attempts,
                    last_error: error,
                });
            };

            tracing::warn!(
                "Attempt {} failed: {}. Retrying in {}s... ({} tries left)",
                attempts,
                error,
                delay.as_secs_f32(),
                tries_left
            );

            on_retry(&PendingRetry {
                error: &error,
                delay,
                attempts_remaining: budget.attempts_remaining,
            });

            if cancel
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                tracing::debug!("Pending retry cancelled");
                return Err(RetryError::Cancelled);
            }
        }
    }
}
