//! Innermost service of the call pipeline: runs one invocation through
//! auth, validation, cache, hooks and the handler.
//!
//! Stage order: `Received -> Authenticated -> Validated -> CacheChecked`,
//! then either `CacheHit -> Completed` or `BeforeHooks -> Handling ->
//! AfterHooks -> Completed`. Failures in the hook/handler stages move to
//! `Failed -> ErrorHooks` and settle as `Completed` (recovered) or
//! `Propagated`. Auth and validation failures return straight away.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use conduit_core::{CallContext, CallStage, ValidationResult};
use serde_json::{json, Value};
use tower::Service;
use tracing::{debug, info_span, warn, Instrument};

use super::action::{AuthRequirement, Invocation};
use super::auth::AuthGate;
use super::cache::CacheGate;
use super::error::ActionError;
use super::registry::{ActionRegistry, ResolvedAction};

struct DispatcherInner {
    registry: Arc<ActionRegistry>,
    auth: Arc<AuthGate>,
    cache: CacheGate,
}

/// Resolves and executes invocations against a frozen [`ActionRegistry`].
///
/// Cheap to clone; every clone shares the same registry and gates.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<ActionRegistry>, auth: Arc<AuthGate>, cache: CacheGate) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                auth,
                cache,
            }),
        }
    }

    /// Runs `inv` to completion.
    ///
    /// # Errors
    ///
    /// Returns `ActionNotFound`, an auth or validation error, or whatever
    /// failure the error-hooks did not recover.
    pub async fn dispatch(&self, inv: Invocation) -> Result<Value, ActionError> {
        let resolved = self.inner.registry.resolve_id(&inv.action)?;

        let mut ctx = CallContext::new(inv.action, inv.params);
        ctx.meta = inv.meta;
        ctx.token = inv.token;

        let span = info_span!(
            "dispatch",
            action = %ctx.action,
            correlation_id = %ctx.correlation_id,
        );
        self.run(&resolved, ctx).instrument(span).await
    }

    async fn run(&self, resolved: &ResolvedAction, mut ctx: CallContext) -> Result<Value, ActionError> {
        let action = &resolved.action;

        if action.auth == AuthRequirement::Required {
            match self.inner.auth.authenticate(ctx.token.as_deref()) {
                Ok(identity) => {
                    ctx.meta.insert(
                        "user".to_string(),
                        json!({ "id": identity.id, "username": identity.username }),
                    );
                    ctx.identity = Some(identity);
                }
                Err(err) => {
                    ctx.fail();
                    debug!(kind = ?err.kind(), "authentication failed");
                    return Err(err);
                }
            }
        }
        ctx.advance(CallStage::Authenticated);

        if let Some(schema) = &action.params {
            if let ValidationResult::Invalid { violations } = schema.validate(&ctx.params) {
                ctx.fail();
                debug!(violations = violations.len(), "parameter validation failed");
                return Err(ActionError::validation(violations));
            }
        }
        ctx.advance(CallStage::Validated);

        // Key on the params as received; before-hooks may rewrite ctx.params.
        let cache_params = action.cache.as_ref().map(|_| ctx.params.clone());
        if let Some(params) = &cache_params {
            if let Some(hit) = self.inner.cache.lookup(resolved, params).await {
                ctx.advance(CallStage::CacheHit);
                ctx.advance(CallStage::Completed);
                return Ok(hit);
            }
        }
        ctx.advance(CallStage::CacheChecked);

        match Self::run_chain(resolved, &mut ctx).await {
            Ok(result) => {
                if let Some(params) = &cache_params {
                    self.inner.cache.store(resolved, params, &result).await;
                }
                ctx.advance(CallStage::Completed);
                Ok(result)
            }
            Err(err) => {
                ctx.fail();
                let failed_at = ctx.failed_at.map_or("unknown", CallStage::as_str);
                debug!(failed_at, kind = ?err.kind(), "running error-hooks");
                ctx.advance(CallStage::ErrorHooks);
                match resolved.hooks().run_error(&ctx, err) {
                    Ok(recovered) => {
                        ctx.advance(CallStage::Completed);
                        Ok(recovered)
                    }
                    Err(err) => {
                        ctx.advance(CallStage::Propagated);
                        warn!(failed_at, error = %err, "call failed");
                        Err(err)
                    }
                }
            }
        }
    }

    async fn run_chain(resolved: &ResolvedAction, ctx: &mut CallContext) -> Result<Value, ActionError> {
        let hooks = resolved.hooks();

        ctx.advance(CallStage::BeforeHooks);
        hooks.run_before(ctx)?;

        ctx.advance(CallStage::Handling);
        let raw = resolved.action.handler.handle(ctx).await?;

        ctx.advance(CallStage::AfterHooks);
        hooks.run_after(ctx, raw)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Service<Invocation> for Dispatcher {
    type Response = Value;
    type Error = ActionError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.dispatch(inv).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
