//! Retry loop: run an async operation until success or the policy says stop.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::classify::Classifier;
use super::failure::{FailureClass, StatusCode, TransportCode};
use super::policy::{RetryContext, RetryDecision, RetryPolicy};

/// The caller's cancellation token fired before or during an attempt or backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl Error for Cancelled {}

/// Observability record for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub class: FailureClass,
    pub transport: Option<TransportCode>,
    pub status: Option<StatusCode>,
    /// `None` when the policy declined to retry.
    pub delay: Option<Duration>,
    /// Whether the session used for the attempt should be discarded.
    pub invalidates_session: bool,
}

type Observer = Arc<dyn Fn(&AttemptRecord) + Send + Sync>;

/// Whole milliseconds for log fields, saturating instead of truncating.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Drives operations through the classifier and retry policy.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Arc<Classifier>,
    observer: Option<Observer>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, classifier: Arc<Classifier>) -> Self {
        Self {
            policy,
            classifier,
            observer: None,
        }
    }

    /// Attach a callback invoked with every attempt record, after logging.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&AttemptRecord) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    /// Runs `op` until it succeeds, the policy stops retrying, or `cancel` fires.
    ///
    /// On a non-retryable failure or when attempts are exhausted the error
    /// returned by the last attempt is returned unchanged. Cancellation
    /// surfaces as `E::from(Cancelled)`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        idempotent: bool,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + From<Cancelled> + 'static,
    {
        let mut ctx = RetryContext::new(idempotent);
        loop {
            if cancel.is_cancelled() {
                return Err(E::from(Cancelled));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(E::from(Cancelled)),
                result = op(cancel.clone()) => result,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(delay) = self.assess(&err, &ctx).delay else {
                return Err(err);
            };
            self.pause(delay, cancel).await.map_err(E::from)?;
            ctx.advance();
        }
    }

    /// Classify `err`, consult the policy and emit the attempt record.
    pub fn assess<E>(&self, err: &E, ctx: &RetryContext) -> AttemptRecord
    where
        E: Error + 'static,
    {
        let failure = self.classifier.classify(err);
        let delay = match self.policy.decide(&failure, ctx) {
            RetryDecision::RetryAfter(d) => Some(d),
            RetryDecision::NoRetry => None,
        };
        let record = AttemptRecord {
            attempt: ctx.attempt,
            class: failure.class(),
            transport: failure.transport_code(),
            status: failure.status_code(),
            delay,
            invalidates_session: failure.invalidates_session(),
        };

        match delay {
            Some(d) => tracing::debug!(
                attempt = record.attempt,
                delay_ms = millis(d),
                class = %record.class,
                transport = ?record.transport,
                status = ?record.status,
                idempotent = ctx.idempotent,
                error = %err,
                "attempt failed; retrying"
            ),
            None => tracing::warn!(
                attempt = record.attempt,
                class = %record.class,
                transport = ?record.transport,
                status = ?record.status,
                idempotent = ctx.idempotent,
                error = %err,
                "attempt failed; giving up"
            ),
        }
        if let Some(observer) = &self.observer {
            observer(&record);
        }
        record
    }

    /// Sleep for a backoff delay, aborting early on cancellation.
    pub async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if delay.is_zero() {
            return if cancel.is_cancelled() {
                Err(Cancelled)
            } else {
                Ok(())
            };
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::rpc::RpcError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn executor(max_attempts: u32) -> RetryExecutor {
        let cfg = RetryConfig {
            max_attempts,
            ..RetryConfig::default()
        };
        RetryExecutor::new(RetryPolicy::from_config(&cfg), Arc::new(Classifier::new()))
    }

    #[test]
    fn millis_saturates_for_huge_delays() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_three_unavailable_failures() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&delays);
        let exec = executor(10).with_observer(move |r| seen.lock().unwrap().push(r.delay));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<&str, RpcError> = exec
            .execute(false, &cancel, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(RpcError::status(StatusCode::Unavailable, "node down"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let delays = delays.lock().unwrap();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| matches!(d, Some(d) if !d.is_zero())));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_with_last_error() {
        let exec = executor(5);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), RpcError> = exec
            .execute(true, &cancel, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(RpcError::status(StatusCode::Overloaded, format!("try {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(RpcError::Status { status, message }) => {
                assert_eq!(status, StatusCode::Overloaded);
                assert_eq!(message, "try 5");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_on_first_attempt() {
        let exec = executor(10);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), RpcError> = exec
            .execute(true, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RpcError::status(StatusCode::Unauthorized, "bad token")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(RpcError::Status {
                status: StatusCode::Unauthorized,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn undetermined_write_is_not_repeated() {
        let exec = executor(10);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), RpcError> = exec
            .execute(false, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RpcError::status(StatusCode::Undetermined, "commit unknown")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_operation() {
        let exec = executor(10);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RpcError> = exec
            .execute(true, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts_the_loop() {
        let cfg = RetryConfig {
            slow_base_ms: 10_000,
            slow_cap_ms: 60_000,
            ..RetryConfig::default()
        };
        let exec = RetryExecutor::new(RetryPolicy::from_config(&cfg), Arc::new(Classifier::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let counter = Arc::clone(&calls);
        let result: Result<(), RpcError> = exec
            .execute(true, &cancel, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(RpcError::status(StatusCode::Overloaded, "slow down")) }
            })
            .await;

        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_conflict_retries_without_waiting() {
        let exec = executor(10);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let result: Result<u32, RpcError> = exec
            .execute(false, &cancel, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RpcError::status(StatusCode::BadSession, "stale"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
