// src/retry.rs
//! One retry policy shared by the poller, classifier, ecosystem mapper and
//! artifact writer. The schedule comes from `backoff`; the decision to retry
//! comes from a caller-supplied classification of the error.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Wall-clock ceiling across all attempts, measured from the first one.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1_000)
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    /// Retry, but not sooner than the given delay (e.g. `Retry-After`).
    RetryAfter(Duration),
    Fail,
}

/// Successful value plus the number of retries it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub retries: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{error}")]
    Fatal { error: E, retries: u32 },
    #[error("{last} (gave up after {retries} retries)")]
    Exhausted { last: E, retries: u32 },
}

impl<E> RetryError<E> {
    pub fn retries(&self) -> u32 {
        match self {
            RetryError::Fatal { retries, .. } | RetryError::Exhausted { retries, .. } => *retries,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms: initial_delay_ms.saturating_mul(32),
            multiplier: 2.0,
            max_elapsed_ms: Some(initial_delay_ms.saturating_mul(60)),
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            max_elapsed_ms: None,
        }
    }

    fn schedule(&self) -> ExponentialBackoff<backoff::SystemClock> {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let mut b = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: self.multiplier.max(1.0),
            max_interval: Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms)),
            max_elapsed_time: self.max_elapsed_ms.map(Duration::from_millis),
            ..Default::default()
        };
        b.reset();
        b
    }

    /// Run `op` until it succeeds, `classify` says `Fail`, the retry count is
    /// used up, or the wall-clock ceiling passes. `op` receives the zero-based
    /// attempt number.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        op_name: &str,
        mut op: F,
        classify: C,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Verdict,
        E: Display,
    {
        let mut schedule = self.schedule();
        let mut retries = 0u32;
        loop {
            let err = match op(retries).await {
                Ok(value) => return Ok(Attempted { value, retries }),
                Err(e) => e,
            };

            let floor = match classify(&err) {
                Verdict::Fail => return Err(RetryError::Fatal { error: err, retries }),
                Verdict::Retry => Duration::ZERO,
                Verdict::RetryAfter(d) => d,
            };

            if retries >= self.max_retries {
                return Err(RetryError::Exhausted { last: err, retries });
            }
            let Some(delay) = schedule.next_backoff() else {
                tracing::warn!(target: "retry", op = op_name, retries, "wall-clock ceiling reached");
                return Err(RetryError::Exhausted { last: err, retries });
            };
            let cap = Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms));
            let delay = delay.max(floor.min(cap));

            tracing::warn!(
                target: "retry",
                op = op_name,
                attempt = retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
            max_elapsed_ms: None,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let out = fast(5)
            .run(
                "t",
                move |_| async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("busy")
                    } else {
                        Ok(n)
                    }
                },
                |_| Verdict::Retry,
            )
            .await
            .unwrap();
        assert_eq!(out.value, 2);
        assert_eq!(out.retries, 2);
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let err = fast(5)
            .run(
                "t",
                move |_| async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("denied")
                },
                |_| Verdict::Fail,
            )
            .await
            .unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let err = fast(3)
            .run(
                "t",
                move |_| async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("down")
                },
                |_| Verdict::Retry,
            )
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.retries(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn none_policy_is_single_shot() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let err = RetryPolicy::none()
            .run(
                "t",
                move |_| async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("down")
                },
                |_| Verdict::Retry,
            )
            .await
            .unwrap_err();
        assert_eq!(err.retries(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
