//! Action-invocation framework.
//!
//! A call flows through:
//!
//! 1. **Broker** (`broker`): caller surface, service lifecycle, event wiring
//! 2. **Middleware** (`middleware`): Tower layers (load-shedding, timeout, metrics)
//! 3. **Dispatcher** (`dispatcher`): auth gate, validation, cache gate, hooks, handler
//! 4. **Domain services** (`domain`): `users` and `products`
//! 5. **Background workers** (`worker`): periodic cache and revocation sweeps

pub mod action;
pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod events;
pub mod hooks;
pub mod middleware;
pub mod registry;
pub mod worker;

pub use action::{Action, ActionHandler, AuthRequirement, CachePolicy, Invocation};
pub use auth::AuthGate;
pub use broker::ServiceBroker;
pub use cache::{CacheGate, CacheStore, InvalidateGroup, MemoryCacheStore};
pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use error::{ActionError, ErrorKind, ErrorPayload};
pub use events::{EventBus, EventListener, LocalEventBus, SubscriptionId};
pub use hooks::{AfterHook, BeforeHook, ErrorHook, ErrorOutcome, HookChain, HookSet};
pub use registry::{
    ActionRegistry, ManagedService, ResolvedAction, ServiceContext, ServiceDefinition,
    ServiceRegistry,
};
pub use worker::{BackgroundRunnable, BackgroundWorker, CacheSweeper, SweepTask};
