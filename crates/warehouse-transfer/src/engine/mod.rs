//! Step execution contract.
//!
//! A job is driven as a sequence of discrete steps (credential resolution,
//! table enumeration, one step per table). Each step runs under
//! [`execute_step`], which bounds every attempt with a timeout, retries
//! transient failures with capped exponential backoff and stops as soon as
//! the job is cancelled.
//!
//! Scheduling jobs is the concern of an [`ExecutionEngine`]. The crate ships
//! [`LocalEngine`], an in-process engine backed by tokio tasks and the job
//! registry.

mod local;

pub use local::LocalEngine;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TransferError};
use crate::orchestrator::TransferResult;
use crate::registry::JobRegistry;

/// Budget for listing source tables.
pub const DEFAULT_ENUMERATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Budget for one table's extract, create and load.
pub const DEFAULT_TABLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Budget for resolving credentials, including registered source lookups.
pub const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Time an interrupted attempt gets to close its connections.
const RELEASE_GRACE: Duration = Duration::from_secs(5);

/// Retry policy applied to one step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the delay before the second attempt.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the backoff multiplier (at least 1.0).
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = if coefficient.is_finite() {
            coefficient.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Set the upper bound for any single delay.
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Per-step execution options.
#[derive(Debug, Clone)]
pub struct StepOptions {
    pub name: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// How long an interrupted attempt may keep running to release resources.
    pub grace: Duration,
}

impl StepOptions {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            retry: RetryPolicy::default(),
            grace: RELEASE_GRACE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Handed to every attempt of a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the attempt times out or the job is cancelled.
    pub cancel: CancellationToken,
}

enum Interrupt {
    Timeout,
    Cancelled,
}

/// Run `step` under the timeout and retry policy in `options`.
///
/// An attempt that times out or is cancelled has its token cancelled and is
/// polled for up to `options.grace` so that scoped connections get closed.
/// Only errors for which [`TransferError::is_retryable`] holds are retried.
pub async fn execute_step<T, F, Fut>(
    options: &StepOptions,
    cancel: &CancellationToken,
    mut step: F,
) -> Result<T>
where
    F: FnMut(StepContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let attempt_token = cancel.child_token();
        let fut = step(StepContext {
            attempt,
            cancel: attempt_token.clone(),
        });
        tokio::pin!(fut);

        debug!("Step '{}' attempt {}", options.name, attempt);
        let interrupted = tokio::select! {
            biased;
            result = &mut fut => Ok(result),
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(options.timeout) => Err(Interrupt::Timeout),
        };

        let outcome = match interrupted {
            Ok(result) => result,
            Err(interrupt) => {
                attempt_token.cancel();
                if tokio::time::timeout(options.grace, &mut fut).await.is_err() {
                    warn!(
                        "Step '{}' did not release its resources within {:?}",
                        options.name, options.grace
                    );
                }
                match interrupt {
                    Interrupt::Cancelled => return Err(TransferError::Cancelled),
                    Interrupt::Timeout => Err(TransferError::Timeout {
                        step: options.name.clone(),
                        after: options.timeout,
                    }),
                }
            }
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !err.is_retryable() || attempt >= options.retry.max_attempts {
            return Err(err);
        }

        let delay = options.retry.delay_after(attempt);
        warn!(
            "Step '{}' attempt {}/{} failed: {}; retrying in {:?}",
            options.name, attempt, options.retry.max_attempts, err, delay
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Schedules orchestration of persisted jobs.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Start orchestrating a persisted job. Fails with `DuplicateJob` if the
    /// id is already running and `NotFound` if no record exists.
    async fn enqueue(&self, job_id: &str) -> Result<JobHandle>;

    /// Last durably recorded status of a job.
    async fn query_status(&self, job_id: &str) -> Result<String>;

    /// Request cancellation. Returns false if the job is not running.
    async fn cancel(&self, job_id: &str) -> Result<bool>;
}

/// Handle to an enqueued job.
pub struct JobHandle {
    job_id: String,
    registry: Arc<dyn JobRegistry>,
    done: watch::Receiver<bool>,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: String,
        registry: Arc<dyn JobRegistry>,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id,
            registry,
            done,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Whether orchestration has finished.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Last durably recorded status.
    pub async fn query_status(&self) -> Result<String> {
        let record = self
            .registry
            .get_job(&self.job_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("job {}", self.job_id)))?;
        Ok(record.status.to_string())
    }

    /// Wait for orchestration to finish and return the recorded result.
    pub async fn wait(mut self) -> Result<TransferResult> {
        // A dropped sender also means the task is gone.
        let _ = self.done.wait_for(|finished| *finished).await;

        let record = self
            .registry
            .get_job(&self.job_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("job {}", self.job_id)))?;
        if !record.status.is_terminal() {
            return Err(TransferError::Interrupted(self.job_id));
        }
        record.result.ok_or_else(|| {
            TransferError::registry(format!(
                "job {} finished without a result: {}",
                self.job_id,
                record.error.as_deref().unwrap_or("unknown error")
            ))
        })
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::WarehouseKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(name: &str, timeout: Duration) -> StepOptions {
        StepOptions::new(name, timeout)
            .with_retry(
                RetryPolicy::default()
                    .with_initial_interval(Duration::from_millis(1))
                    .with_max_interval(Duration::from_millis(5)),
            )
            .with_grace(Duration::from_millis(200))
    }

    #[test]
    fn test_retry_policy_defaults_and_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_clamps() {
        let policy = RetryPolicy::default()
            .with_max_attempts(0)
            .with_backoff_coefficient(0.5);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_coefficient, 1.0);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let value = execute_step(&fast("flaky", Duration::from_secs(5)), &cancel, |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if ctx.attempt < 3 {
                    Err(TransferError::connection(WarehouseKind::Postgres, "refused"))
                } else {
                    Ok(ctx.attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_exhausted() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let err = execute_step(&fast("down", Duration::from_secs(5)), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransferError::connection(WarehouseKind::Clickhouse, "down")) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Connection { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let err = execute_step(&fast("bad-sql", Duration::from_secs(5)), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransferError::query(WarehouseKind::Postgres, "syntax error")) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Query { transient: false, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_cancels_attempt_and_runs_release() {
        let released = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let options = fast("slow", Duration::from_millis(20)).with_retry(RetryPolicy::no_retry());
        let counter = released.clone();
        let err = execute_step(&options, &cancel, move |ctx| {
            let counter = counter.clone();
            async move {
                ctx.cancel.cancelled().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TransferError::Cancelled)
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Timeout { .. }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_cancel_stops_retries() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let err = execute_step(&fast("cancelled", Duration::from_secs(5)), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            token.cancel();
            async { Err::<(), _>(TransferError::connection(WarehouseKind::Snowflake, "reset")) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_runs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = execute_step(&fast("never", Duration::from_secs(1)), &cancel, |_| async {
            Ok::<_, TransferError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
