//! Action definitions and the request type that flows through the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{ActionId, CallContext, ParamSchema};
use serde_json::{Map, Value};

use super::error::ActionError;
use super::hooks::{AfterHook, BeforeHook, ErrorHook, ErrorOutcome, HookSet};

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Business logic behind an action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &CallContext) -> Result<Value, ActionError>;
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Whether an action requires a verified caller identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthRequirement {
    #[default]
    None,
    Required,
}

/// Decides whether a cached entry may still be served for `params`.
///
/// Consulted on every lookup; a rejected lookup runs the full pipeline.
pub trait CacheGuard: Send + Sync {
    fn admits(&self, params: &Value) -> bool;
}

impl<F> CacheGuard for F
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn admits(&self, params: &Value) -> bool {
        self(params)
    }
}

/// Opt-in response caching for an action.
#[derive(Clone)]
pub struct CachePolicy {
    /// Parameter names (dotted paths allowed) that make up the cache key.
    /// Empty means the whole parameter object.
    pub keys: Vec<String>,
    /// How long a stored result stays valid.
    pub ttl: Duration,
    /// Invalidation groups the entry is tagged with. Empty means the owning
    /// service's name.
    pub groups: Vec<String>,
    /// Optional admission check run before a hit is served.
    pub guard: Option<Arc<dyn CacheGuard>>,
}

impl CachePolicy {
    #[must_use]
    pub fn new<I, S>(keys: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ttl,
            groups: Vec::new(),
            guard: None,
        }
    }

    /// Tags entries with an extra invalidation group.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// Serves hits only while `guard` admits the call's params.
    #[must_use]
    pub fn guarded_by(mut self, guard: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    #[must_use]
    pub fn admits(&self, params: &Value) -> bool {
        match &self.guard {
            Some(guard) => guard.admits(params),
            None => true,
        }
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("keys", &self.keys)
            .field("ttl", &self.ttl)
            .field("groups", &self.groups)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A named, independently invocable unit of business logic.
///
/// Immutable once registered.
#[derive(Clone)]
pub struct Action {
    pub name: String,
    pub handler: Arc<dyn ActionHandler>,
    pub params: Option<ParamSchema>,
    pub cache: Option<CachePolicy>,
    pub auth: AuthRequirement,
    pub hooks: HookSet,
}

impl Action {
    #[must_use]
    pub fn new(name: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        Self::from_arc(name, Arc::new(handler))
    }

    #[must_use]
    pub fn from_arc(name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            params: None,
            cache: None,
            auth: AuthRequirement::None,
            hooks: HookSet::new(),
        }
    }

    #[must_use]
    pub fn params(mut self, schema: ParamSchema) -> Self {
        self.params = Some(schema);
        self
    }

    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    #[must_use]
    pub fn auth_required(mut self) -> Self {
        self.auth = AuthRequirement::Required;
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn before(
        mut self,
        hook: impl Fn(&mut CallContext) -> Result<(), ActionError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks = self.hooks.with_before(Arc::new(hook) as Arc<dyn BeforeHook>);
        self
    }

    #[must_use]
    pub fn after(
        mut self,
        hook: impl Fn(&CallContext, Value) -> Result<Value, ActionError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks = self.hooks.with_after(Arc::new(hook) as Arc<dyn AfterHook>);
        self
    }

    #[must_use]
    pub fn on_error(
        mut self,
        hook: impl Fn(&CallContext, ActionError) -> ErrorOutcome + Send + Sync + 'static,
    ) -> Self {
        self.hooks = self.hooks.with_error(Arc::new(hook) as Arc<dyn ErrorHook>);
        self
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("params", &self.params.is_some())
            .field("cache", &self.cache)
            .field("auth", &self.auth)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// A single call request as it enters the middleware stack.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub action: ActionId,
    pub params: Value,
    pub token: Option<String>,
    pub meta: Map<String, Value>,
    pub timeout_ms: u64,
}

impl Invocation {
    #[must_use]
    pub fn new(action: ActionId, params: Value, timeout_ms: u64) -> Self {
        Self {
            action,
            params,
            token: None,
            meta: Map::new(),
            timeout_ms,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        async fn handle(&self, ctx: &CallContext) -> Result<Value, ActionError> {
            Ok(ctx.params.clone())
        }
    }

    #[tokio::test]
    async fn builder_sets_metadata() {
        let action = Action::new("resolveToken", Echo)
            .cache(CachePolicy::new(["token"], Duration::from_secs(3600)))
            .auth_required()
            .before(|_: &mut CallContext| Ok(()));

        assert_eq!(action.name, "resolveToken");
        assert_eq!(action.auth, AuthRequirement::Required);
        assert_eq!(action.cache.as_ref().unwrap().keys, vec!["token".to_string()]);
        assert!(!action.hooks.is_empty());

        let ctx = CallContext::new(ActionId::new("users", "resolveToken"), json!({"token": "t"}));
        assert_eq!(action.handler.handle(&ctx).await.unwrap(), json!({"token": "t"}));
    }

    #[test]
    fn cache_policy_groups_accumulate() {
        let policy = CachePolicy::new(Vec::<String>::new(), Duration::from_secs(1))
            .group("users")
            .group("follows");
        assert_eq!(policy.groups, vec!["users", "follows"]);
        assert!(policy.keys.is_empty());
        assert!(policy.admits(&json!({})));
    }

    #[test]
    fn cache_guard_sees_call_params() {
        let policy = CachePolicy::new(["token"], Duration::from_secs(1))
            .guarded_by(|params: &Value| params["token"] != "revoked");
        assert!(policy.admits(&json!({"token": "fresh"})));
        assert!(!policy.admits(&json!({"token": "revoked"})));
    }

    #[test]
    fn invocation_defaults_to_no_token() {
        let inv = Invocation::new(ActionId::new("a", "b"), json!({}), 1000);
        assert!(inv.token.is_none());
        let inv = inv.with_token(Some("abc".into()));
        assert_eq!(inv.token.as_deref(), Some("abc"));
    }
}
