//! Timeout middleware for calls.
//!
//! Rejects calls that exceed their `timeout_ms` with `ActionError::Timeout`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tower::{Layer, Service};

use crate::service::action::Invocation;
use crate::service::error::ActionError;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-call timeout enforcement.
///
/// The timeout is read from each invocation's `timeout_ms`, so different
/// calls can carry different budgets.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Invocation> for TimeoutService<S>
where
    S: Service<Invocation, Response = Value, Error = ActionError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = ActionError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let timeout_ms = inv.timeout_ms;
        let fut = self.inner.call(inv);
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(ActionError::Timeout { timeout_ms }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use conduit_core::ActionId;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<Invocation> for SlowService {
        type Response = Value;
        type Error = ActionError;
        type Future = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _inv: Invocation) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(json!("done"))
            })
        }
    }

    fn make_inv(timeout_ms: u64) -> Invocation {
        Invocation::new(ActionId::new("svc", "slow"), json!({}), timeout_ms)
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer.layer(SlowService { delay_ms: 10 });
        assert_eq!(svc.oneshot(make_inv(1000)).await.unwrap(), json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn exceeds_timeout_returns_error() {
        let svc = TimeoutLayer.layer(SlowService { delay_ms: 200 });
        let err = svc.oneshot(make_inv(50)).await.unwrap_err();
        assert!(matches!(err, ActionError::Timeout { timeout_ms: 50 }));
    }
}
