//! The caller-facing broker: owns services, assembles the call pipeline and
//! wires domain events to cache invalidation.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::ActionId;
use serde_json::Value;
use tower::ServiceExt;
use tracing::info;

use super::action::Invocation;
use super::cache::InvalidateGroup;
use super::dispatcher::Dispatcher;
use super::error::ActionError;
use super::events::SubscriptionId;
use super::middleware::{build_call_pipeline, CallPipeline};
use super::registry::{ActionRegistry, ManagedService, ServiceContext, ServiceRegistry};
use super::worker::{BackgroundWorker, CacheSweeper, SweepTask};

/// State that exists only between `start` and `stop`.
struct Running {
    pipeline: CallPipeline,
    actions: Arc<ActionRegistry>,
    subscriptions: Vec<SubscriptionId>,
    sweeper: BackgroundWorker<CacheSweeper>,
}

/// Hosts services and routes calls to their actions.
///
/// Register services, `start`, then `call` concurrently through a shared
/// reference. Actions are frozen at `start`; registering afterwards fails.
pub struct ServiceBroker {
    ctx: ServiceContext,
    services: ServiceRegistry,
    running: Option<Running>,
}

impl ServiceBroker {
    #[must_use]
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            services: ServiceRegistry::new(),
            running: None,
        }
    }

    /// Shared capabilities, for constructing services against this broker.
    #[must_use]
    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Typed handle to a registered service.
    #[must_use]
    pub fn service<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.services.get::<T>()
    }

    /// Adds a service. Initialization order follows registration order.
    ///
    /// # Errors
    ///
    /// Fails if the broker is already started or the name is taken.
    pub fn register<T: ManagedService>(&mut self, service: T) -> anyhow::Result<Arc<T>> {
        if self.is_started() {
            anyhow::bail!("cannot register '{}' on a started broker", service.name());
        }
        self.services.register(service)
    }

    /// Builds the action registry, initializes services, subscribes event
    /// wiring and starts the cache sweeper.
    ///
    /// # Errors
    ///
    /// Fails on duplicate actions or if a service fails to initialize.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.is_started() {
            anyhow::bail!("broker already started");
        }

        let mut actions = ActionRegistry::new();
        let mut wiring = Vec::new();
        for service in self.services.services() {
            let def = service.definition();
            actions.register_service(&def.name, def.actions, def.hooks)?;
            wiring.push((def.invalidations, def.listeners));
        }

        self.services.init_all(&self.ctx).await?;

        let events = &self.ctx.events;
        let mut subscriptions = Vec::new();
        for (invalidations, listeners) in wiring {
            for (event, group) in invalidations {
                let listener = InvalidateGroup::new(self.ctx.cache.clone(), group);
                subscriptions.push(events.subscribe(&event, Arc::new(listener)));
            }
            for (event, listener) in listeners {
                subscriptions.push(events.subscribe(&event, listener));
            }
        }

        let actions = Arc::new(actions);
        let dispatcher = Dispatcher::new(
            Arc::clone(&actions),
            Arc::clone(&self.ctx.auth),
            self.ctx.cache.clone(),
        );
        let pipeline = build_call_pipeline(dispatcher, &self.ctx.config);
        let sweeper = BackgroundWorker::start(
            CacheSweeper::new(self.ctx.cache.clone(), Arc::clone(&self.ctx.auth)),
            Duration::from_millis(self.ctx.config.cache_sweep_interval_ms.max(1)),
        );

        info!(
            node_id = %self.ctx.config.node_id,
            services = self.services.services().len(),
            actions = actions.len(),
            subscriptions = subscriptions.len(),
            "broker started"
        );

        self.running = Some(Running {
            pipeline,
            actions,
            subscriptions,
            sweeper,
        });
        Ok(())
    }

    /// Invokes `service.action` with `params`, optionally authenticated by
    /// `token`, using the configured default timeout.
    ///
    /// # Errors
    ///
    /// Returns the unrecovered failure of the call.
    pub async fn call(
        &self,
        service: &str,
        action: &str,
        params: Value,
        token: Option<&str>,
    ) -> Result<Value, ActionError> {
        let inv = Invocation::new(
            ActionId::new(service, action),
            params,
            self.ctx.config.default_call_timeout_ms,
        )
        .with_token(token.map(str::to_string));
        self.invoke(inv).await
    }

    /// Runs a fully specified invocation through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the unrecovered failure of the call, or `Internal` if the
    /// broker is not started.
    pub async fn invoke(&self, inv: Invocation) -> Result<Value, ActionError> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| ActionError::from(anyhow::anyhow!("broker is not started")))?;
        running.pipeline.clone().oneshot(inv).await
    }

    /// Emits a domain event on the broker's bus.
    pub async fn emit(&self, event: &str, payload: Value) {
        self.ctx.events.emit(event, payload).await;
    }

    /// Queues an immediate purge of expired cache entries and lapsed
    /// revocations on the sweeper.
    ///
    /// # Errors
    ///
    /// Fails if the broker is not started.
    pub async fn request_sweep(&self) -> anyhow::Result<()> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("broker is not started"))?;
        running.sweeper.submit(SweepTask::RunFull).await
    }

    /// Registered action ids; empty before `start`.
    #[must_use]
    pub fn action_ids(&self) -> Vec<ActionId> {
        self.running
            .as_ref()
            .map(|running| running.actions.ids())
            .unwrap_or_default()
    }

    /// Drops event subscriptions, shuts services down in reverse order and
    /// stops the sweeper. No-op if not started.
    ///
    /// # Errors
    ///
    /// Returns the first service shutdown failure.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        for id in running.subscriptions.drain(..) {
            self.ctx.events.unsubscribe(id);
        }
        let result = self.services.shutdown_all(false).await;
        running.sweeper.stop().await;
        info!(node_id = %self.ctx.config.node_id, "broker stopped");
        result
    }
}

impl std::fmt::Debug for ServiceBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBroker")
            .field("ctx", &self.ctx)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}
