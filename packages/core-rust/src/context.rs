//! Per-invocation call state: params, metadata, identity, token,
//! correlation id and the pipeline stage the call has reached.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{ActionId, Identity};

/// Pipeline stage an invocation is currently in.
///
/// Happy path: `Received -> Authenticated -> Validated -> CacheChecked ->
/// BeforeHooks -> Handling -> AfterHooks -> Completed`, or `CacheHit ->
/// Completed` when the cache short-circuits. Failures move to `Failed`,
/// then `ErrorHooks`, settling as `Completed` (recovered) or `Propagated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStage {
    Received,
    Authenticated,
    Validated,
    CacheChecked,
    CacheHit,
    BeforeHooks,
    Handling,
    AfterHooks,
    Failed,
    ErrorHooks,
    Completed,
    Propagated,
}

impl CallStage {
    /// Whether the invocation has settled.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Propagated)
    }

    /// Lower-case label used in log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Authenticated => "authenticated",
            Self::Validated => "validated",
            Self::CacheChecked => "cache_checked",
            Self::CacheHit => "cache_hit",
            Self::BeforeHooks => "before_hooks",
            Self::Handling => "handling",
            Self::AfterHooks => "after_hooks",
            Self::Failed => "failed",
            Self::ErrorHooks => "error_hooks",
            Self::Completed => "completed",
            Self::Propagated => "propagated",
        }
    }
}

/// Per-invocation state threaded through every pipeline stage.
///
/// Created fresh for each call and dropped when the call settles; never
/// shared between invocations. Hooks and handlers see the same instance, so
/// anything the auth gate or a before-hook writes is visible downstream.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The action being invoked.
    pub action: ActionId,
    /// Caller-supplied parameters (a JSON object).
    pub params: Value,
    /// Free-form call metadata, writable by any stage.
    pub meta: Map<String, Value>,
    /// Identity resolved by the auth gate, if the action required one.
    pub identity: Option<Identity>,
    /// Raw token the identity was resolved from.
    pub token: Option<String>,
    /// Correlation id used in logs for this invocation.
    pub correlation_id: Uuid,
    /// Current pipeline stage.
    pub stage: CallStage,
    /// Stage at which the invocation failed, once it has.
    pub failed_at: Option<CallStage>,
}

impl CallContext {
    /// Creates a context in the `Received` stage with a fresh correlation id.
    #[must_use]
    pub fn new(action: ActionId, params: Value) -> Self {
        Self {
            action,
            params,
            meta: Map::new(),
            identity: None,
            token: None,
            correlation_id: Uuid::new_v4(),
            stage: CallStage::Received,
            failed_at: None,
        }
    }

    /// Looks up a top-level parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Mutable access to a top-level parameter, if params is an object.
    pub fn param_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.params.get_mut(name)
    }

    /// Moves the context to `stage`.
    pub fn advance(&mut self, stage: CallStage) {
        self.stage = stage;
    }

    /// Marks the context failed, remembering the stage that failed.
    pub fn fail(&mut self) {
        if self.failed_at.is_none() {
            self.failed_at = Some(self.stage);
        }
        self.stage = CallStage::Failed;
    }
}
