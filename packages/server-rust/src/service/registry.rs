//! Service lifecycle and action lookup: the shared [`ServiceContext`],
//! service definitions, the ordered [`ServiceRegistry`] and the frozen
//! [`ActionRegistry`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{ActionId, ClockSource, SystemClock};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::action::Action;
use super::auth::AuthGate;
use super::cache::{CacheGate, MemoryCacheStore};
use super::config::ServerConfig;
use super::error::ActionError;
use super::events::{EventBus, EventListener, LocalEventBus};
use super::hooks::{HookChain, HookSet};
use crate::security::JwtCodec;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Shared capabilities handed to services at construction and init.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<ServerConfig>,
    pub clock: Arc<dyn ClockSource>,
    pub events: Arc<dyn EventBus>,
    pub auth: Arc<AuthGate>,
    pub cache: CacheGate,
}

impl ServiceContext {
    /// Builds the default in-process wiring: system clock, local event bus,
    /// JWT auth and in-memory cache.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Same as [`ServiceContext::new`] with every expiry decision read from
    /// `clock`.
    #[must_use]
    pub fn with_clock(config: ServerConfig, clock: Arc<dyn ClockSource>) -> Self {
        let auth = AuthGate::new(
            Arc::new(JwtCodec::new(&config.jwt_secret)),
            Arc::clone(&clock),
            config.token_cache_ttl(),
            config.token_cache_capacity,
        );
        let cache = CacheGate::new(Arc::new(MemoryCacheStore::new(Arc::clone(&clock))));
        Self {
            config: Arc::new(config),
            clock,
            events: Arc::new(LocalEventBus::new()),
            auth: Arc::new(auth),
            cache,
        }
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ServiceDefinition
// ---------------------------------------------------------------------------

/// Everything a service contributes to the broker: actions, wildcard hooks,
/// cache invalidation subscriptions and event listeners.
pub struct ServiceDefinition {
    pub name: String,
    pub actions: Vec<Action>,
    /// Service-wide hooks, run after each action's own hooks.
    pub hooks: HookSet,
    /// `(event, group)`: invalidate `group` whenever `event` is emitted.
    pub invalidations: Vec<(String, String)>,
    pub listeners: Vec<(String, Arc<dyn EventListener>)>,
}

impl ServiceDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            hooks: HookSet::new(),
            invalidations: Vec::new(),
            listeners: Vec::new(),
        }
    }

    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn invalidate_on(mut self, event: impl Into<String>, group: impl Into<String>) -> Self {
        self.invalidations.push((event.into(), group.into()));
        self
    }

    #[must_use]
    pub fn listen(mut self, event: impl Into<String>, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push((event.into(), listener));
        self
    }
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("actions", &self.actions.iter().map(|a| &a.name).collect::<Vec<_>>())
            .field("invalidations", &self.invalidations)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed service trait. All domain services implement this.
///
/// Services are registered with a `ServiceRegistry`, initialized in registration
/// order, and shut down in reverse registration order. The `Any` bound enables
/// type-based lookup via `ServiceRegistry::get::<T>()`.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Returns the unique name of this service (e.g., `"users"`).
    fn name(&self) -> &'static str;

    /// Actions, hooks and subscriptions this service contributes.
    fn definition(&self) -> ServiceDefinition;

    /// Initialize the service with the given context.
    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Shut down the service. If `terminate` is true, skip graceful cleanup.
    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry for lifecycle-managed services.
///
/// Lookup by name (`get_by_name`) or by concrete type (`get::<T>`).
/// Services are initialized in registration order and shut down in reverse order.
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    init_order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    /// Register a service. Registration order determines init/shutdown sequencing.
    ///
    /// # Errors
    ///
    /// Fails if a service with the same name is already registered.
    pub fn register<T: ManagedService>(&self, service: T) -> anyhow::Result<Arc<T>> {
        let name = service.name();
        if self.by_name.contains_key(name) {
            anyhow::bail!("service '{name}' is already registered");
        }
        let arc = Arc::new(service);
        self.by_name.insert(name, arc.clone());
        self.by_type.insert(TypeId::of::<T>(), arc.clone());
        self.init_order.write().push(name);
        Ok(arc)
    }

    /// Retrieve a service by its concrete type.
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Retrieve a service by its name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Services in registration order.
    pub fn services(&self) -> Vec<Arc<dyn ManagedService>> {
        self.init_order
            .read()
            .iter()
            .filter_map(|name| self.get_by_name(name))
            .collect()
    }

    /// Initialize all registered services in registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any service's `init()` call fails.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        for service in self.services() {
            service.init(ctx).await?;
        }
        Ok(())
    }

    /// Shut down all registered services in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any service's `shutdown()` call fails.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        for service in self.services().iter().rev() {
            service.shutdown(terminate).await?;
        }
        Ok(())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// An action together with its owning service's wildcard hooks.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub id: ActionId,
    pub action: Arc<Action>,
    pub service_hooks: Arc<HookSet>,
}

impl ResolvedAction {
    /// Action hooks first, then the service wildcard tier.
    #[must_use]
    pub fn hooks(&self) -> HookChain<'_> {
        HookChain::new(&self.action.hooks, &self.service_hooks)
    }
}

/// Named actions per service. Populated at startup, then frozen behind an
/// `Arc` and read concurrently.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionId, Arc<Action>>,
    service_hooks: HashMap<String, Arc<HookSet>>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `action` under `service`.
    ///
    /// # Errors
    ///
    /// `DuplicateAction` if `(service, action.name)` is already registered.
    pub fn register(&mut self, service: &str, action: Action) -> Result<(), ActionError> {
        let id = ActionId::new(service, action.name.clone());
        if self.actions.contains_key(&id) {
            return Err(ActionError::DuplicateAction { id });
        }
        self.actions.insert(id, Arc::new(action));
        Ok(())
    }

    /// Sets the wildcard hooks applied to every action of `service`.
    pub fn set_service_hooks(&mut self, service: &str, hooks: HookSet) {
        self.service_hooks.insert(service.to_string(), Arc::new(hooks));
    }

    /// Registers all of a service's actions and its wildcard hooks.
    /// Nothing is registered if any action name collides.
    ///
    /// # Errors
    ///
    /// `DuplicateAction` on the first colliding name.
    pub fn register_service(
        &mut self,
        service: &str,
        actions: Vec<Action>,
        hooks: HookSet,
    ) -> Result<(), ActionError> {
        let mut seen = std::collections::HashSet::new();
        for action in &actions {
            let id = ActionId::new(service, action.name.clone());
            if self.actions.contains_key(&id) || !seen.insert(action.name.clone()) {
                return Err(ActionError::DuplicateAction { id });
            }
        }
        for action in actions {
            self.register(service, action)?;
        }
        self.set_service_hooks(service, hooks);
        Ok(())
    }

    /// Looks up `service.name`.
    ///
    /// # Errors
    ///
    /// `ActionNotFound` if no such action is registered.
    pub fn resolve(&self, service: &str, name: &str) -> Result<ResolvedAction, ActionError> {
        self.resolve_id(&ActionId::new(service, name))
    }

    /// Looks up an action by id.
    ///
    /// # Errors
    ///
    /// `ActionNotFound` if no such action is registered.
    pub fn resolve_id(&self, id: &ActionId) -> Result<ResolvedAction, ActionError> {
        let action = self
            .actions
            .get(id)
            .ok_or_else(|| ActionError::ActionNotFound { id: id.clone() })?;
        let service_hooks = self
            .service_hooks
            .get(&id.service)
            .cloned()
            .unwrap_or_default();
        Ok(ResolvedAction {
            id: id.clone(),
            action: Arc::clone(action),
            service_hooks,
        })
    }

    /// Registered action ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<ActionId> {
        let mut ids: Vec<ActionId> = self.actions.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use conduit_core::CallContext;
    use serde_json::{json, Value};

    use super::*;
    use crate::service::action::ActionHandler;

    /// Test service that tracks lifecycle calls via atomic counters.
    struct TestService {
        svc_name: &'static str,
        init_counter: AtomicU32,
        order_log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl TestService {
        fn new(name: &'static str, order_log: Arc<parking_lot::Mutex<Vec<String>>>) -> Self {
            Self {
                svc_name: name,
                init_counter: AtomicU32::new(0),
                order_log,
            }
        }
    }

    #[async_trait]
    impl ManagedService for TestService {
        fn name(&self) -> &'static str {
            self.svc_name
        }

        fn definition(&self) -> ServiceDefinition {
            ServiceDefinition::new(self.svc_name)
        }

        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.init_counter.fetch_add(1, Ordering::SeqCst);
            self.order_log.lock().push(format!("init:{}", self.svc_name));
            Ok(())
        }

        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            self.order_log
                .lock()
                .push(format!("shutdown:{}", self.svc_name));
            Ok(())
        }
    }

    /// A distinct service type for type-based lookup testing.
    struct AnotherService;

    impl ManagedService for AnotherService {
        fn name(&self) -> &'static str {
            "another"
        }

        fn definition(&self) -> ServiceDefinition {
            ServiceDefinition::new("another")
        }
    }

    struct Const(Value);

    #[async_trait]
    impl ActionHandler for Const {
        async fn handle(&self, _ctx: &CallContext) -> Result<Value, ActionError> {
            Ok(self.0.clone())
        }
    }

    fn make_ctx() -> ServiceContext {
        ServiceContext::new(ServerConfig::default())
    }

    #[test]
    fn register_and_get_by_name_and_type() {
        let registry = ServiceRegistry::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        registry.register(TestService::new("users", log)).unwrap();
        registry.register(AnotherService).unwrap();

        assert_eq!(registry.get_by_name("users").unwrap().name(), "users");
        assert_eq!(registry.get::<AnotherService>().unwrap().name(), "another");
        assert!(registry.get_by_name("nonexistent").is_none());
    }

    #[test]
    fn duplicate_service_name_is_rejected() {
        let registry = ServiceRegistry::new();
        registry.register(AnotherService).unwrap();
        assert!(registry.register(AnotherService).is_err());
    }

    #[tokio::test]
    async fn init_in_order_and_shutdown_in_reverse() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(TestService::new("first", log.clone())).unwrap();
        registry.register(TestService::new("second", log.clone())).unwrap();
        registry.register(TestService::new("third", log.clone())).unwrap();

        registry.init_all(&make_ctx()).await.unwrap();
        registry.shutdown_all(false).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "init:first",
                "init:second",
                "init:third",
                "shutdown:third",
                "shutdown:second",
                "shutdown:first",
            ]
        );
    }

    #[test]
    fn duplicate_action_is_rejected() {
        let mut actions = ActionRegistry::new();
        actions
            .register("users", Action::new("create", Const(json!(1))))
            .unwrap();
        let err = actions
            .register("users", Action::new("create", Const(json!(2))))
            .unwrap_err();
        assert!(matches!(err, ActionError::DuplicateAction { .. }));

        // Same name under another service is fine.
        actions
            .register("products", Action::new("create", Const(json!(3))))
            .unwrap();
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn register_service_is_all_or_nothing() {
        let mut actions = ActionRegistry::new();
        let err = actions
            .register_service(
                "users",
                vec![
                    Action::new("get", Const(json!(1))),
                    Action::new("get", Const(json!(2))),
                ],
                HookSet::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ActionError::DuplicateAction { .. }));
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn resolve_returns_action_with_service_hooks() {
        let mut actions = ActionRegistry::new();
        let hooks = HookSet::new().after(|_: &CallContext, v: Value| Ok(json!([v])));
        actions
            .register_service("users", vec![Action::new("get", Const(json!("x")))], hooks)
            .unwrap();

        let resolved = actions.resolve("users", "get").unwrap();
        assert_eq!(resolved.id.to_string(), "users.get");

        let ctx = CallContext::new(resolved.id.clone(), json!({}));
        let raw = resolved.action.handler.handle(&ctx).await.unwrap();
        assert_eq!(resolved.hooks().run_after(&ctx, raw).unwrap(), json!(["x"]));
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let actions = ActionRegistry::new();
        let err = actions.resolve("users", "nope").unwrap_err();
        assert!(matches!(err, ActionError::ActionNotFound { id } if id.to_string() == "users.nope"));
    }
}
