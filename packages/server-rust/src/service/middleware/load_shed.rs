//! Load-shedding middleware for calls.
//!
//! Rejects calls with `ActionError::Overloaded` once `max_concurrent_calls`
//! are already in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::service::action::Invocation;
use crate::service::error::ActionError;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent calls via a semaphore.
///
/// When all permits are taken, incoming calls are rejected immediately
/// rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }

    /// Permits not currently held by an in-flight call.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Invocation> for LoadShedService<S>
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
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            tracing::warn!(action = %inv.action, "shedding call, broker overloaded");
            ::metrics::counter!("conduit_calls_shed_total", "action" => inv.action.to_string())
                .increment(1);
            return Box::pin(async { Err(ActionError::Overloaded) });
        };

        let fut = self.inner.call(inv);
        Box::pin(async move {
            // Permit is held until the call settles.
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_core::ActionId;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

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
                Ok(Value::Null)
            })
        }
    }

    fn make_inv() -> Invocation {
        Invocation::new(ActionId::new("svc", "slow"), json!({}), 5000)
    }

    #[tokio::test]
    async fn allows_calls_under_limit() {
        let svc = LoadShedLayer::new(10).layer(SlowService { delay_ms: 1 });
        assert_eq!(svc.oneshot(make_inv()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn permit_is_released_when_call_settles() {
        let layer = LoadShedLayer::new(2);
        let mut svc = layer.layer(SlowService { delay_ms: 1 });

        let pending = svc.call(make_inv());
        assert_eq!(layer.available(), 1);
        pending.await.unwrap();
        assert_eq!(layer.available(), 2);
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let mut svc = LoadShedLayer::new(1).layer(SlowService { delay_ms: 500 });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let in_flight = svc.call(make_inv());
        let _in_flight = tokio::spawn(in_flight);

        let err = svc.call(make_inv()).await.unwrap_err();
        assert!(matches!(err, ActionError::Overloaded));
    }
}
