//! 弹性模块：为每次上游调用提供重试、退避与按端点熔断。
//!
//! # Resilience Module
//!
//! Every provider call goes through [`ResiliencyWrapper::execute`]. The
//! wrapper covers connection establishment of streaming calls and the whole of
//! non-streaming calls.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-endpoint Closed / Open / HalfOpen state machine and its registry |
//! | [`retry`] | Retry policy, failure classes and `retry-after` parsing |
//!
//! ## Failure Handling
//!
//! - Transient failures (connect timeout, connection reset, 5xx, 429) are
//!   retried with exponential backoff and jitter, and count toward the breaker.
//! - Any other error is returned at once. An upstream 4xx rejection proves the
//!   endpoint is reachable and counts as a breaker success.
//! - While the breaker is Open the call fails with `CircuitOpen` and the
//!   closure is never invoked.
//!
//! ```rust
//! use ai_gateway_rust::resilience::{BreakerRegistry, CircuitBreakerConfig, ResiliencyWrapper, RetryPolicy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let breakers = Arc::new(BreakerRegistry::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_cooldown(Duration::from_secs(30)),
//! ));
//! let wrapper = ResiliencyWrapper::new(RetryPolicy::new().with_max_attempts(3), breakers);
//! assert_eq!(wrapper.policy().max_attempts, 3);
//! ```

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerPermit, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot,
    CircuitState,
};
pub use retry::{parse_retry_after, FailureClass, RetryPolicy, MAX_RETRY_AFTER};

use crate::error::TimeoutPhase;
use crate::types::EndpointKey;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Retry + circuit breaking around a single logical upstream call.
#[derive(Debug, Clone)]
pub struct ResiliencyWrapper {
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl ResiliencyWrapper {
    pub fn new(policy: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self { policy, breakers }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `call` until it succeeds, fails non-transiently, or attempts run out.
    ///
    /// `call` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, key: &EndpointKey, mut call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get(key);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let permit = breaker.try_acquire()?;

            let err = match call(attempt).await {
                Ok(value) => {
                    permit.success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            let Some(class) = err.failure_class() else {
                match &err {
                    Error::UpstreamFatal { .. } => permit.success(),
                    _ => permit.release(),
                }
                return Err(err);
            };
            permit.failure();

            if !self.policy.is_retryable(class) || attempt >= self.policy.max_attempts {
                warn!(
                    endpoint = %key,
                    attempt,
                    failure_class = %class,
                    error = %err,
                    "upstream call failed, giving up"
                );
                return Err(exhausted(err, attempt));
            }

            let delay = self.policy.delay_for(attempt, err.retry_after());
            debug!(
                endpoint = %key,
                attempt,
                failure_class = %class,
                delay_ms = delay.as_millis() as u64,
                "retrying upstream call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn exhausted(err: Error, attempts: u32) -> Error {
    match err {
        Error::UpstreamTransient {
            class: FailureClass::ConnectTimeout,
            ..
        } => Error::Timeout {
            phase: TimeoutPhase::Connect,
        },
        Error::UpstreamTransient {
            status, message, ..
        } => Error::UpstreamFatal {
            status,
            attempts,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn wrapper(max_attempts: u32, threshold: u32) -> ResiliencyWrapper {
        ResiliencyWrapper::new(
            RetryPolicy::new()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(10))
                .with_jitter(false),
            Arc::new(BreakerRegistry::new(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(threshold)
                    .with_cooldown(Duration::from_secs(60)),
            )),
        )
    }

    fn key() -> EndpointKey {
        EndpointKey::new(Provider::OpenAi, "https://api.example.com/v1")
    }

    fn server_error() -> Error {
        Error::UpstreamTransient {
            class: FailureClass::ServerError,
            status: Some(500),
            message: "boom".into(),
            retry_after: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let w = wrapper(3, 10);
        let calls = AtomicU32::new(0);
        let out = w
            .execute(&key(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(server_error())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_fatal() {
        let w = wrapper(2, 10);
        let err = w
            .execute(&key(), |_| async { Err::<(), _>(server_error()) })
            .await
            .unwrap_err();
        match err {
            Error::UpstreamFatal {
                status, attempts, ..
            } => {
                assert_eq!(status, Some(500));
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_exhaustion_is_timeout() {
        let w = wrapper(2, 10);
        let err = w
            .execute(&key(), |_| async {
                Err::<(), _>(Error::transient(FailureClass::ConnectTimeout, "connect"))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                phase: TimeoutPhase::Connect
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_is_not_retried() {
        let w = wrapper(5, 10);
        let calls = AtomicU32::new(0);
        let err = w
            .execute(&key(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::UpstreamFatal {
                        status: Some(400),
                        attempts: 1,
                        message: "bad request".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamFatal { status: Some(400), .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            w.breakers().snapshot(&key()).unwrap().consecutive_failures,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits() {
        let w = wrapper(1, 2);
        for _ in 0..2 {
            let _ = w
                .execute(&key(), |_| async { Err::<(), _>(server_error()) })
                .await;
        }
        let calls = AtomicU32::new(0);
        let err = w
            .execute(&key(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
