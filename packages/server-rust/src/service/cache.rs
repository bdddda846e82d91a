//! Response caching for actions that opt in with a [`CachePolicy`].
//!
//! Keys are `"{service}.{action}:{blake3 hex}"` over a canonical rendering of
//! the selected parameters, so parameter order never changes the key. Values
//! are stored as `MessagePack`. Every entry carries invalidation groups; the
//! owning service's name is used when the policy names none.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::ClockSource;
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::action::CachePolicy;
use super::events::EventListener;
use super::registry::ResolvedAction;

// ---------------------------------------------------------------------------
// CacheStore trait
// ---------------------------------------------------------------------------

/// Byte-level storage behind the cache gate.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch an unexpired entry.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store `value` for `ttl`, tagged with `groups`. Overwrites.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        groups: &[String],
    ) -> anyhow::Result<()>;

    /// Remove every entry tagged with `group`, returning how many went.
    async fn evict_group(&self, group: &str) -> anyhow::Result<usize>;

    /// Drop expired entries, returning how many went.
    async fn purge_expired(&self) -> anyhow::Result<usize>;
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at_ms: u64,
    groups: Vec<String>,
}

/// Sharded in-memory [`CacheStore`] with TTLs judged by a [`ClockSource`].
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn ClockSource>,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let now = self.clock.now_millis();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        // Ref dropped above; removing while holding it would deadlock the shard.
        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.expires_at_ms <= now);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        groups: &[String],
    ) -> anyhow::Result<()> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at_ms: self.clock.now_millis().saturating_add(ttl_ms),
                groups: groups.to_vec(),
            },
        );
        Ok(())
    }

    async fn evict_group(&self, group: &str) -> anyhow::Result<usize> {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.groups.iter().any(|g| g == group));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn purge_expired(&self) -> anyhow::Result<usize> {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}

impl std::fmt::Debug for MemoryCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheStore")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CacheGate
// ---------------------------------------------------------------------------

/// Applies an action's cache policy around the dispatcher.
///
/// Store failures never fail a call: they are logged and the call proceeds
/// as a miss.
#[derive(Clone)]
pub struct CacheGate {
    store: Arc<dyn CacheStore>,
}

impl CacheGate {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Cached result for `params`, if the action has a policy and an
    /// unexpired entry exists.
    pub async fn lookup(&self, resolved: &ResolvedAction, params: &Value) -> Option<Value> {
        let policy = resolved.action.cache.as_ref()?;
        if !policy.admits(params) {
            tracing::debug!(action = %resolved.id, "cache guard rejected lookup");
            return None;
        }
        let key = cache_key(resolved, policy, params);

        let bytes = match self.store.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(action = %resolved.id, key = %key, "cache miss");
                return None;
            }
            Err(err) => {
                tracing::warn!(action = %resolved.id, error = %err, "cache lookup failed");
                return None;
            }
        };

        match rmp_serde::from_slice::<Value>(&bytes) {
            Ok(value) => {
                tracing::debug!(action = %resolved.id, key = %key, "cache hit");
                Some(value)
            }
            Err(err) => {
                tracing::warn!(action = %resolved.id, error = %err, "cached value unreadable");
                None
            }
        }
    }

    /// Stores `result` under the key derived from `params`. No-op for
    /// actions without a policy.
    pub async fn store(&self, resolved: &ResolvedAction, params: &Value, result: &Value) {
        let Some(policy) = resolved.action.cache.as_ref() else {
            return;
        };
        let key = cache_key(resolved, policy, params);

        let bytes = match rmp_serde::to_vec(result) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(action = %resolved.id, error = %err, "result not cacheable");
                return;
            }
        };

        let default_group;
        let groups: &[String] = if policy.groups.is_empty() {
            default_group = [resolved.id.service.clone()];
            &default_group
        } else {
            &policy.groups
        };

        if let Err(err) = self.store.set(&key, bytes, policy.ttl, groups).await {
            tracing::warn!(action = %resolved.id, error = %err, "cache store failed");
        }
    }

    /// Removes every entry tagged with `group`.
    pub async fn invalidate(&self, group: &str) -> usize {
        match self.store.evict_group(group).await {
            Ok(removed) => {
                tracing::debug!(group, removed, "cache group invalidated");
                removed
            }
            Err(err) => {
                tracing::warn!(group, error = %err, "cache invalidation failed");
                0
            }
        }
    }

    /// Drops expired entries.
    pub async fn purge_expired(&self) -> usize {
        match self.store.purge_expired().await {
            Ok(removed) => removed,
            Err(err) => {
                tracing::warn!(error = %err, "cache purge failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for CacheGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGate").finish_non_exhaustive()
    }
}

/// Event listener that invalidates one cache group whenever it fires.
pub struct InvalidateGroup {
    gate: CacheGate,
    group: String,
}

impl InvalidateGroup {
    #[must_use]
    pub fn new(gate: CacheGate, group: impl Into<String>) -> Self {
        Self {
            gate,
            group: group.into(),
        }
    }
}

#[async_trait]
impl EventListener for InvalidateGroup {
    async fn on_event(&self, event: &str, _payload: &Value) {
        let removed = self.gate.invalidate(&self.group).await;
        tracing::debug!(event, group = %self.group, removed, "invalidated on event");
    }
}

// ---------------------------------------------------------------------------
// Keying
// ---------------------------------------------------------------------------

fn cache_key(resolved: &ResolvedAction, policy: &CachePolicy, params: &Value) -> String {
    let selected = if policy.keys.is_empty() {
        canonical(params)
    } else {
        let mut map = Map::new();
        let mut keys: Vec<&String> = policy.keys.iter().collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            let value = lookup_path(params, key).map_or(Value::Null, canonical);
            map.insert(key.clone(), value);
        }
        Value::Object(map)
    };
    let digest = blake3::hash(selected.to_string().as_bytes());
    format!("{}:{}", resolved.id, digest.to_hex())
}

fn lookup_path<'a>(params: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(params, |value, segment| value.get(segment))
}

/// Rebuilds objects with sorted keys so rendering is order-independent.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
