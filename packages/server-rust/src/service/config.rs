use std::time::Duration;

/// Broker-level configuration.
///
/// Controls call timeouts, concurrency limits, token handling and background
/// task intervals.
#[derive(Clone)]
pub struct ServerConfig {
    /// Unique identifier for this broker node.
    pub node_id: String,
    /// Shared secret used to sign and verify access tokens.
    pub jwt_secret: String,
    /// Default timeout for calls in milliseconds.
    pub default_call_timeout_ms: u64,
    /// Maximum number of concurrent calls before load shedding.
    pub max_concurrent_calls: u32,
    /// How long a verified identity stays cached, in seconds.
    pub token_cache_ttl_secs: u64,
    /// Maximum number of cached identities.
    pub token_cache_capacity: usize,
    /// Lifetime of tokens issued on create/login, in days.
    pub token_lifetime_days: u64,
    /// Interval between expired-entry sweeps in milliseconds.
    pub cache_sweep_interval_ms: u64,
}

impl ServerConfig {
    #[must_use]
    pub fn token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.token_cache_ttl_secs)
    }

    #[must_use]
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_days.saturating_mul(24 * 60 * 60))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            jwt_secret: "jwt-conduit-secret".to_string(),
            default_call_timeout_ms: 30_000,
            max_concurrent_calls: 1000,
            token_cache_ttl_secs: 3600,
            token_cache_capacity: 10_000,
            token_lifetime_days: 60,
            cache_sweep_interval_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("node_id", &self.node_id)
            .field("jwt_secret", &"<redacted>")
            .field("default_call_timeout_ms", &self.default_call_timeout_ms)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("token_cache_ttl_secs", &self.token_cache_ttl_secs)
            .field("token_cache_capacity", &self.token_cache_capacity)
            .field("token_lifetime_days", &self.token_lifetime_days)
            .field("cache_sweep_interval_ms", &self.cache_sweep_interval_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secret() {
        let config = ServerConfig {
            jwt_secret: "hunter2".to_string(),
            ..ServerConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn token_lifetime_is_sixty_days_by_default() {
        assert_eq!(
            ServerConfig::default().token_lifetime(),
            Duration::from_secs(60 * 24 * 3600)
        );
    }
}
