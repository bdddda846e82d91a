//! In-process domain event bus.
//!
//! Services emit events such as `users.create`; the broker subscribes cache
//! invalidations and service listeners to them at startup and drops the
//! subscriptions on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receives events a subscription matched.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &str, payload: &Value);
}

#[async_trait]
impl<F> EventListener for F
where
    F: Fn(&str, &Value) + Send + Sync,
{
    async fn on_event(&self, event: &str, payload: &Value) {
        self(event, payload);
    }
}

/// Publish/subscribe channel for domain events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver `payload` to every listener subscribed to `event`.
    async fn emit(&self, event: &str, payload: Value);

    /// Subscribe `listener` to `event`.
    fn subscribe(&self, event: &str, listener: Arc<dyn EventListener>) -> SubscriptionId;

    /// Drop a subscription. Returns `false` if it was not active.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

// ---------------------------------------------------------------------------
// LocalEventBus
// ---------------------------------------------------------------------------

struct Subscription {
    id: SubscriptionId,
    event: String,
    listener: Arc<dyn EventListener>,
}

/// Event bus delivering to listeners in the emitting task, in subscription
/// order. `emit` returns once every listener has run.
#[derive(Default)]
pub struct LocalEventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl LocalEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn emit(&self, event: &str, payload: Value) {
        // Snapshot under the lock; listeners may subscribe or emit themselves.
        let listeners: Vec<Arc<dyn EventListener>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|sub| sub.event == event)
            .map(|sub| Arc::clone(&sub.listener))
            .collect();

        tracing::debug!(event, listeners = listeners.len(), "emitting event");
        for listener in listeners {
            listener.on_event(event, &payload).await;
        }
    }

    fn subscribe(&self, event: &str, listener: Arc<dyn EventListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            event: event.to_string(),
            listener,
        });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        subs.len() != before
    }
}

impl std::fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEventBus")
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
