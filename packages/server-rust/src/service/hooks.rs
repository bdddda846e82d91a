//! Before/after/error interceptors composed around an action handler.
//!
//! Hooks live in two tiers: the action's own [`HookSet`] and its service's
//! wildcard [`HookSet`]. For every stage the action tier runs first, then the
//! wildcard tier, each in registration order. Hooks are synchronous; anything
//! that needs I/O belongs in the handler.

use std::sync::Arc;

use conduit_core::CallContext;
use serde_json::Value;
use tracing::warn;

use super::error::ActionError;

// ---------------------------------------------------------------------------
// Hook traits
// ---------------------------------------------------------------------------

/// Runs before the handler. May mutate the context; stops the call only by failing.
pub trait BeforeHook: Send + Sync {
    fn before(&self, ctx: &mut CallContext) -> Result<(), ActionError>;
}

/// Runs after a successful handler, receiving the in-flight result.
///
/// Must return a result; returning `null` in place of a non-null result is
/// reported as [`ActionError::HookContractViolation`].
pub trait AfterHook: Send + Sync {
    fn after(&self, ctx: &CallContext, result: Value) -> Result<Value, ActionError>;
}

/// Decision returned by an [`ErrorHook`].
#[derive(Debug, Clone)]
pub enum ErrorOutcome {
    /// Convert the failure into a successful result. Stops the error chain.
    Recovered(Value),
    /// Pass the failure on to the next error-hook, and finally the caller.
    Propagated(ActionError),
}

/// Runs when a before-hook, the handler, or an after-hook fails.
pub trait ErrorHook: Send + Sync {
    fn on_error(&self, ctx: &CallContext, error: ActionError) -> ErrorOutcome;
}

impl<F> BeforeHook for F
where
    F: Fn(&mut CallContext) -> Result<(), ActionError> + Send + Sync,
{
    fn before(&self, ctx: &mut CallContext) -> Result<(), ActionError> {
        self(ctx)
    }
}

impl<F> AfterHook for F
where
    F: Fn(&CallContext, Value) -> Result<Value, ActionError> + Send + Sync,
{
    fn after(&self, ctx: &CallContext, result: Value) -> Result<Value, ActionError> {
        self(ctx, result)
    }
}

impl<F> ErrorHook for F
where
    F: Fn(&CallContext, ActionError) -> ErrorOutcome + Send + Sync,
{
    fn on_error(&self, ctx: &CallContext, error: ActionError) -> ErrorOutcome {
        self(ctx, error)
    }
}

// ---------------------------------------------------------------------------
// HookSet
// ---------------------------------------------------------------------------

/// Ordered hook lists for one tier (a single action, or a service wildcard).
#[derive(Clone, Default)]
pub struct HookSet {
    before: Vec<Arc<dyn BeforeHook>>,
    after: Vec<Arc<dyn AfterHook>>,
    error: Vec<Arc<dyn ErrorHook>>,
}

impl HookSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a before-hook closure.
    #[must_use]
    pub fn before(
        self,
        hook: impl Fn(&mut CallContext) -> Result<(), ActionError> + Send + Sync + 'static,
    ) -> Self {
        self.with_before(Arc::new(hook))
    }

    /// Appends an after-hook closure.
    #[must_use]
    pub fn after(
        self,
        hook: impl Fn(&CallContext, Value) -> Result<Value, ActionError> + Send + Sync + 'static,
    ) -> Self {
        self.with_after(Arc::new(hook))
    }

    /// Appends an error-hook closure.
    #[must_use]
    pub fn on_error(
        self,
        hook: impl Fn(&CallContext, ActionError) -> ErrorOutcome + Send + Sync + 'static,
    ) -> Self {
        self.with_error(Arc::new(hook))
    }

    #[must_use]
    pub fn with_before(mut self, hook: Arc<dyn BeforeHook>) -> Self {
        self.before.push(hook);
        self
    }

    #[must_use]
    pub fn with_after(mut self, hook: Arc<dyn AfterHook>) -> Self {
        self.after.push(hook);
        self
    }

    #[must_use]
    pub fn with_error(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.error.push(hook);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty() && self.error.is_empty()
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .field("error", &self.error.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HookChain
// ---------------------------------------------------------------------------

/// Two-tier view over an action's hooks and its service's wildcard hooks.
pub struct HookChain<'a> {
    action: &'a HookSet,
    service: &'a HookSet,
}

impl<'a> HookChain<'a> {
    #[must_use]
    pub fn new(action: &'a HookSet, service: &'a HookSet) -> Self {
        Self { action, service }
    }

    /// Runs before-hooks in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a before-hook.
    pub fn run_before(&self, ctx: &mut CallContext) -> Result<(), ActionError> {
        for hook in self.action.before.iter().chain(&self.service.before) {
            hook.before(ctx)?;
        }
        Ok(())
    }

    /// Threads `result` through after-hooks: hook n+1 receives hook n's output.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by an after-hook, or
    /// `HookContractViolation` if a hook dropped a non-null result.
    pub fn run_after(&self, ctx: &CallContext, result: Value) -> Result<Value, ActionError> {
        let mut current = result;
        for (index, hook) in self.action.after.iter().chain(&self.service.after).enumerate() {
            let had_value = !current.is_null();
            current = hook.after(ctx, current)?;
            if had_value && current.is_null() {
                return Err(ActionError::HookContractViolation {
                    detail: format!("after-hook #{index} of '{}' dropped the result", ctx.action),
                });
            }
        }
        Ok(current)
    }

    /// Routes a failure through error-hooks.
    ///
    /// Returns `Ok` when a hook recovers, otherwise the propagated failure.
    /// A hook that re-raises with a different error kind is logged and the
    /// failure it received is propagated instead.
    ///
    /// # Errors
    ///
    /// Returns the failure when no error-hook recovers it.
    pub fn run_error(&self, ctx: &CallContext, error: ActionError) -> Result<Value, ActionError> {
        let mut current = error;
        for hook in self.action.error.iter().chain(&self.service.error) {
            let received = current.clone();
            match hook.on_error(ctx, current) {
                ErrorOutcome::Recovered(value) => return Ok(value),
                ErrorOutcome::Propagated(next) if next.kind() == received.kind() => current = next,
                ErrorOutcome::Propagated(next) => {
                    warn!(
                        action = %ctx.action,
                        expected = ?received.kind(),
                        got = ?next.kind(),
                        "error-hook changed the failure kind; keeping the original"
                    );
                    current = received;
                }
            }
        }
        Err(current)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
