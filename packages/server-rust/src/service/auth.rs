//! Token authentication for actions that require a caller identity.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{ClockSource, Identity};
use dashmap::DashMap;
use quick_cache::sync::Cache;

use super::error::ActionError;
use crate::traits::{TokenClaims, TokenCodec, TokenError};

#[derive(Debug, Clone)]
struct CachedIdentity {
    identity: Identity,
    /// Cache entry deadline, seconds since Unix epoch.
    valid_until: u64,
}

/// Resolves raw tokens to identities.
///
/// Verified identities are cached under the raw token for
/// `min(cache_ttl, remaining token lifetime)`. Revoked tokens are
/// deny-listed until they would have expired anyway.
pub struct AuthGate {
    codec: Arc<dyn TokenCodec>,
    clock: Arc<dyn ClockSource>,
    cache: Cache<String, CachedIdentity>,
    revoked: DashMap<String, u64>,
    cache_ttl: Duration,
}

impl AuthGate {
    #[must_use]
    pub fn new(
        codec: Arc<dyn TokenCodec>,
        clock: Arc<dyn ClockSource>,
        cache_ttl: Duration,
        cache_capacity: usize,
    ) -> Self {
        Self {
            codec,
            clock,
            cache: Cache::new(cache_capacity.max(1)),
            revoked: DashMap::new(),
            cache_ttl,
        }
    }

    /// Resolves `token` to an identity.
    ///
    /// # Errors
    ///
    /// - `MissingToken` when no token was supplied.
    /// - `ExpiredToken` when the claims are past expiry, whether or not the
    ///   signature checks out.
    /// - `InvalidToken` for malformed, badly signed or revoked tokens.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, ActionError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(ActionError::MissingToken)?;
        let now = self.clock.now_secs();

        if self.revoked.contains_key(token) {
            tracing::debug!("rejected revoked token");
            return Err(ActionError::InvalidToken {
                reason: "token has been revoked".to_string(),
            });
        }

        if let Some(cached) = self.cache.get(token) {
            if now < cached.valid_until {
                return Ok(cached.identity);
            }
            self.cache.remove(token);
        }

        let claims = match self.codec.verify(token) {
            Ok(claims) => claims,
            Err(TokenError::InvalidSignature { claims: Some(claims) }) if claims.exp <= now => {
                tracing::debug!(exp = claims.exp, "badly signed token is also expired");
                return Err(ActionError::ExpiredToken);
            }
            Err(err) => {
                tracing::debug!(error = %err, "token rejected");
                return Err(ActionError::InvalidToken {
                    reason: err.to_string(),
                });
            }
        };

        let identity = Identity {
            id: claims.id,
            username: claims.username,
            expires_at: claims.exp,
        };
        if identity.is_expired(now) {
            tracing::debug!(user = %identity.id, exp = identity.expires_at, "token expired");
            return Err(ActionError::ExpiredToken);
        }

        let valid_until = now
            .saturating_add(self.cache_ttl.as_secs())
            .min(identity.expires_at);
        self.cache.insert(
            token.to_string(),
            CachedIdentity {
                identity: identity.clone(),
                valid_until,
            },
        );
        Ok(identity)
    }

    /// Signs a token for `id`/`username` valid for `lifetime` from now.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if signing fails.
    pub fn issue(&self, id: &str, username: &str, lifetime: Duration) -> Result<String, ActionError> {
        let now = self.clock.now_secs();
        let claims = TokenClaims {
            id: id.to_string(),
            username: username.to_string(),
            exp: now.saturating_add(lifetime.as_secs()),
            iat: now,
        };
        self.codec
            .sign(&claims)
            .map_err(|err| ActionError::from(anyhow::Error::new(err)))
    }

    /// Evicts `token` from the identity cache and refuses it until its
    /// expiry. Tokens that cannot be decoded are deny-listed for the cache
    /// TTL.
    pub fn revoke(&self, token: &str) {
        self.cache.remove(token);
        let now = self.clock.now_secs();
        let until = match self.codec.verify(token) {
            Ok(claims) | Err(TokenError::InvalidSignature { claims: Some(claims) }) => claims.exp,
            Err(_) => now.saturating_add(self.cache_ttl.as_secs()),
        };
        if until > now {
            self.revoked.insert(token.to_string(), until);
        }
    }

    /// Forgets revocations whose tokens have expired. Returns how many.
    pub fn purge_revoked(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.revoked.len();
        self.revoked.retain(|_, until| *until > now);
        before.saturating_sub(self.revoked.len())
    }

    /// Number of identities currently cached.
    #[must_use]
    pub fn cached_identities(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("cached", &self.cache.len())
            .field("revoked", &self.revoked.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}
