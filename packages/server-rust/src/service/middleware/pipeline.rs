//! Pipeline composition: combines all middleware layers into a single service stack.

use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::action::Invocation;
use crate::service::config::ServerConfig;
use crate::service::dispatcher::Dispatcher;
use crate::service::error::ActionError;

/// The assembled call stack, cloneable per call.
pub type CallPipeline = BoxCloneSyncService<Invocation, Value, ActionError>;

/// Build the call pipeline by wrapping the `Dispatcher` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce per-call timeouts
/// 3. `MetricsLayer` -- record timing and outcome (closest to the dispatcher)
#[must_use]
pub fn build_call_pipeline(dispatcher: Dispatcher, config: &ServerConfig) -> CallPipeline {
    let stack = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_calls))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(dispatcher);
    BoxCloneSyncService::new(stack)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use conduit_core::{ActionId, CallContext, ManualClock};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::security::JwtCodec;
    use crate::service::action::{Action, ActionHandler};
    use crate::service::auth::AuthGate;
    use crate::service::cache::{CacheGate, MemoryCacheStore};
    use crate::service::registry::ActionRegistry;

    struct Sleepy;

    #[async_trait]
    impl ActionHandler for Sleepy {
        async fn handle(&self, ctx: &CallContext) -> Result<Value, ActionError> {
            let ms = ctx.param("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!("awake"))
        }
    }

    fn pipeline(config: &ServerConfig) -> CallPipeline {
        let clock = Arc::new(ManualClock::new(0));
        let mut registry = ActionRegistry::new();
        registry.register("svc", Action::new("sleep", Sleepy)).unwrap();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(AuthGate::new(
                Arc::new(JwtCodec::new("s")),
                clock.clone(),
                Duration::from_secs(60),
                8,
            )),
            CacheGate::new(Arc::new(MemoryCacheStore::new(clock))),
        );
        build_call_pipeline(dispatcher, config)
    }

    fn inv(sleep_ms: u64, timeout_ms: u64) -> Invocation {
        Invocation::new(ActionId::new("svc", "sleep"), json!({ "sleep_ms": sleep_ms }), timeout_ms)
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let svc = pipeline(&ServerConfig::default());
        assert_eq!(svc.oneshot(inv(0, 1000)).await.unwrap(), json!("awake"));
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_enforces_call_timeout() {
        let svc = pipeline(&ServerConfig::default());
        let err = svc.oneshot(inv(500, 100)).await.unwrap_err();
        assert!(matches!(err, ActionError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_the_concurrency_limit() {
        let config = ServerConfig {
            max_concurrent_calls: 1,
            ..ServerConfig::default()
        };
        let svc = pipeline(&config);

        let busy = tokio::spawn(svc.clone().oneshot(inv(1000, 5000)));
        tokio::task::yield_now().await;

        let err = svc.clone().oneshot(inv(0, 5000)).await.unwrap_err();
        assert!(matches!(err, ActionError::Overloaded));
        assert_eq!(busy.await.unwrap().unwrap(), json!("awake"));
    }
}
