//! Metrics middleware for calls.
//!
//! Wraps each call in a `tracing` span and records `conduit_calls_total`
//! and `conduit_call_duration_ms`, labelled by action and outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use serde_json::Value;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::action::Invocation;
use crate::service::error::ActionError;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records call duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome_label(result: &Result<Value, ActionError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(ActionError::Validation { .. }) => "invalid",
        Err(
            ActionError::MissingToken
            | ActionError::InvalidToken { .. }
            | ActionError::ExpiredToken,
        ) => "unauthorized",
        Err(ActionError::Timeout { .. }) => "timeout",
        Err(ActionError::Overloaded) => "overloaded",
        Err(_) => "error",
    }
}

impl<S> Service<Invocation> for MetricsService<S>
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
        let action = inv.action.to_string();

        let span = info_span!(
            "call",
            action = %action,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(inv);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                ::metrics::counter!(
                    "conduit_calls_total",
                    "action" => action.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                ::metrics::histogram!("conduit_call_duration_ms", "action" => action.clone())
                    .record(elapsed.as_secs_f64() * 1000.0);

                tracing::debug!(action = %action, duration_ms, outcome, "call complete");

                result
            }
            .instrument(span),
        )
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

    struct ImmediateService;

    impl Service<Invocation> for ImmediateService {
        type Response = Value;
        type Error = ActionError;
        type Future = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, inv: Invocation) -> Self::Future {
            Box::pin(async move { Ok(inv.params) })
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(ImmediateService);
        let inv = Invocation::new(ActionId::new("users", "get"), json!({"id": 42}), 5000);
        assert_eq!(svc.oneshot(inv).await.unwrap(), json!({"id": 42}));
    }

    #[test]
    fn outcome_labels_group_auth_failures() {
        assert_eq!(outcome_label(&Ok(Value::Null)), "ok");
        assert_eq!(outcome_label(&Err(ActionError::ExpiredToken)), "unauthorized");
        assert_eq!(outcome_label(&Err(ActionError::MissingToken)), "unauthorized");
        assert_eq!(outcome_label(&Err(ActionError::Overloaded)), "overloaded");
        assert_eq!(
            outcome_label(&Err(ActionError::EntityNotFound { id: "1".into() })),
            "error"
        );
    }
}
