//! Retry, deadline and cancellation handling for provider calls.

use crate::config::Limits;
use crate::error::ProviderError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a guarded call did not produce a value.
#[derive(Debug)]
pub(crate) enum CallError {
    /// Caller cancelled, or the deadline expired
    Cancelled,
    /// Provider failed permanently, or kept failing transiently
    Provider(ProviderError),
}

/// Runs provider calls under the configured limits.
///
/// Clones share one pool of `max_in_flight` permits, so nested fan-out never
/// has more than that many provider calls in flight.
#[derive(Debug, Clone)]
pub(crate) struct CallGuard {
    limits: Arc<Limits>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl CallGuard {
    pub(crate) fn new(limits: Limits) -> Self {
        let timeout = limits.call_timeout();
        let permits = Arc::new(Semaphore::new(limits.max_in_flight.max(1)));
        Self { limits: Arc::new(limits), permits, timeout, cancel: CancellationToken::new() }
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.limits
    }

    pub(crate) fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self.clone() }
    }

    pub(crate) fn with_timeout(&self, timeout: Duration) -> Self {
        Self { timeout: Some(timeout), ..self.clone() }
    }

    /// Runs `call`, retrying transient failures with exponential backoff.
    ///
    /// Each attempt holds one permit. The deadline covers all attempts,
    /// including time spent waiting for a permit. Cancellation wins over any
    /// pending attempt or backoff sleep.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let attempts = self.retry(operation, call);
        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, attempts).await.unwrap_or_else(|_| {
                    debug!(operation, ?limit, "provider call exceeded its deadline");
                    Err(CallError::Cancelled)
                }),
                None => attempts.await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!(operation, "provider call cancelled");
                Err(CallError::Cancelled)
            }
            result = bounded => result,
        }
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = {
                let _permit = self.permits.acquire().await.map_err(|_| CallError::Cancelled)?;
                call().await
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.limits.max_attempts => {
                    let delay = self.limits.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(CallError::Provider(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn limits(max_attempts: u32) -> Limits {
        Limits { max_attempts, retry_base_delay_ms: 1, ..Limits::default() }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let guard = CallGuard::new(limits(3));
        let calls = AtomicU32::new(0);

        let result = guard
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Unavailable("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert!(matches!(result, Ok(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let guard = CallGuard::new(limits(2));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guard
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Unavailable("busy".into()))
            })
            .await;

        assert!(matches!(result, Err(CallError::Provider(ProviderError::Unavailable(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let guard = CallGuard::new(limits(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guard
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Rejected)
            })
            .await;

        assert!(matches!(result, Err(CallError::Provider(ProviderError::Rejected))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let guard = CallGuard::new(limits(1)).with_cancellation(token.clone());

        let pending = guard.run("test", || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ProviderError>(1)
        });
        token.cancel();

        assert!(matches!(pending.await, Err(CallError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline() {
        let guard = CallGuard::new(limits(1)).with_timeout(Duration::from_millis(10));

        let result = guard
            .run("test", || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, ProviderError>(1)
            })
            .await;

        assert!(matches!(result, Err(CallError::Cancelled)));
    }

    #[tokio::test]
    async fn test_caps_concurrent_calls() {
        let guard = CallGuard::new(Limits { max_in_flight: 2, ..limits(1) });
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let calls = (0..6).map(|_| {
            guard.run("test", || async {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(())
            })
        });
        let results = join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clones_share_permits() {
        let guard = CallGuard::new(Limits { max_in_flight: 1, ..limits(1) });
        let other = guard.with_timeout(Duration::from_secs(5));
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let call = || async {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, ProviderError>(())
        };
        let (a, b) = tokio::join!(guard.run("a", call), other.run("b", call));

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
