//! Bounded waiting and optimistic-concurrency retries.
//!
//! Every wait in the reconciler goes through [`poll_until`], which takes a
//! [`BackoffPolicy`] and a [`CancellationToken`] so that exhaustion and
//! cancellation surface as errors instead of hanging the event loop.
//! Writes to the shared cluster status go through [`compare_and_swap`].

use crate::error::{InstanceError, InstanceResult};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fixed-interval retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Maximum number of attempts, unbounded when `None`.
    pub max_attempts: Option<u32>,
    /// Maximum wall time across all attempts, unbounded when `None`.
    pub max_duration: Option<Duration>,
}

impl BackoffPolicy {
    /// Poll every `interval` with no limit.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            max_duration: None,
        }
    }

    /// Probe for server start once a second, `i32::MAX` times.
    pub fn until_server_started() -> Self {
        Self::fixed(Duration::from_secs(1)).with_max_attempts(i32::MAX as u32)
    }

    /// Short budget for status writes that race with other instances.
    pub fn status_update() -> Self {
        Self::fixed(Duration::from_millis(10)).with_max_attempts(5)
    }

    /// Limit the number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Limit the total time spent.
    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Whether another attempt may follow `attempts` made over `elapsed`.
    pub fn allows_retry(&self, attempts: u32, elapsed: Duration) -> bool {
        let attempts_left = self.max_attempts.is_none_or(|max| attempts < max);
        let time_left = self
            .max_duration
            .is_none_or(|max| elapsed + self.interval <= max);
        attempts_left && time_left
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    /// The condition holds.
    Ready(T),
    /// Not yet; poll again after the interval.
    Pending,
}

/// Poll `probe` until it is ready, the budget runs out, or `cancel` fires.
///
/// `probe` receives the 1-based attempt number. Errors from `probe` abort
/// the wait immediately; a probe that wants to tolerate an error maps it
/// to [`PollStep::Pending`].
pub async fn poll_until<T, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    condition: &'static str,
    mut probe: F,
) -> InstanceResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = InstanceResult<PollStep<T>>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(InstanceError::Cancelled { condition });
        }

        attempts += 1;
        if let PollStep::Ready(value) = probe(attempts).await? {
            if attempts > 1 {
                tracing::debug!(condition, attempts, "Wait finished");
            }
            return Ok(value);
        }

        if !policy.allows_retry(attempts, started.elapsed()) {
            return Err(InstanceError::WaitExhausted {
                condition,
                attempts,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(InstanceError::Cancelled { condition });
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

/// How a [`compare_and_swap`] loop ended.
#[derive(Debug)]
pub enum CasOutcome<T, E> {
    /// The write was accepted.
    Applied {
        /// Value returned by the accepted write.
        value: T,
        /// Writes attempted, including the accepted one.
        attempts: u32,
    },
    /// Every attempt conflicted.
    Exhausted {
        /// Writes attempted.
        attempts: u32,
        /// Conflict returned by the last write.
        last_error: E,
    },
    /// A write failed with something other than a conflict.
    Failed(E),
}

/// Write `initial`, refetching and retrying while the write conflicts.
///
/// `write` receives the record to write and applies its own mutation.
/// After a conflict the record is refetched with `refetch`; when the
/// refetch itself fails the stale record is reused for the next attempt.
pub async fn compare_and_swap<S, T, E, C, W, WF, R, RF>(
    policy: &BackoffPolicy,
    initial: S,
    is_conflict: C,
    mut write: W,
    mut refetch: R,
) -> CasOutcome<T, E>
where
    S: Clone,
    E: Display,
    C: Fn(&E) -> bool,
    W: FnMut(S) -> WF,
    WF: Future<Output = Result<T, E>>,
    R: FnMut() -> RF,
    RF: Future<Output = Result<S, E>>,
{
    let started = Instant::now();
    let mut current = initial;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match write(current.clone()).await {
            Ok(value) => return CasOutcome::Applied { value, attempts },
            Err(err) if !is_conflict(&err) => return CasOutcome::Failed(err),
            Err(err) => err,
        };

        if !policy.allows_retry(attempts, started.elapsed()) {
            return CasOutcome::Exhausted {
                attempts,
                last_error: err,
            };
        }

        tracing::info!(attempt = attempts, error = %err, "Write conflicted, refetching");
        tokio::time::sleep(policy.interval).await;

        match refetch().await {
            Ok(fresh) => current = fresh,
            Err(refetch_err) => {
                tracing::warn!(error = %refetch_err, "Refetch failed, retrying with stale record");
            }
        }
    }
}
