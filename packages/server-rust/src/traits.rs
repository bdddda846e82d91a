//! Capability seams injected into services: persistence, token signing and
//! password hashing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pluggable persistence backend used by action handlers.
/// Implementations: memory (tests, demo node); a database adapter in production.
///
/// Records are JSON objects carrying a string `id`. Filters are JSON objects
/// matched by field equality.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Return the first record matching every field of `filter`.
    async fn find_one(&self, filter: &Value) -> anyhow::Result<Option<Value>>;

    /// Return all records matching `filter`, in insertion order.
    async fn find(&self, filter: &Value) -> anyhow::Result<Vec<Value>>;

    /// Insert a record, assigning an `id`. Returns the stored record.
    async fn insert(&self, record: Value) -> anyhow::Result<Value>;

    /// Merge `patch` into the record with `id`. Returns the updated record.
    async fn update(&self, id: &str, patch: &Value) -> anyhow::Result<Option<Value>>;

    /// Delete the record with `id`, returning it.
    async fn remove(&self, id: &str) -> anyhow::Result<Option<Value>>;
}

/// A write would give a unique field a value another record already holds.
///
/// Stores return it inside `anyhow::Error`; callers recover it with
/// `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value of '{field}' is already taken")]
pub struct UniqueViolation {
    pub field: String,
}

/// Claims carried inside an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user) id.
    pub id: String,
    pub username: String,
    /// Expiry, seconds since Unix epoch.
    pub exp: u64,
    /// Issued-at, seconds since Unix epoch.
    #[serde(default)]
    pub iat: u64,
}

/// Errors from signing or verifying a token.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed: {0}")]
    Malformed(String),
    /// The signature does not match. `claims` holds the unverified payload
    /// when it could still be decoded.
    #[error("token signature is invalid")]
    InvalidSignature { claims: Option<TokenClaims> },
    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Signs and verifies access tokens against a shared secret.
///
/// `verify` checks the signature and decodes the claims; expiry is judged by
/// the caller against its own clock.
pub trait TokenCodec: Send + Sync {
    /// Sign `claims` into an opaque token.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Signing` if encoding fails.
    fn sign(&self, claims: &TokenClaims) -> Result<String, TokenError>;

    /// Verify the token's signature and return its claims.
    ///
    /// # Errors
    ///
    /// Returns `TokenError` for malformed tokens or bad signatures.
    fn verify(&self, token: &str) -> Result<TokenClaims, TokenError>;
}

/// One-way password hashing.
pub trait PasswordHasher: Send + Sync {
    /// Hash `plaintext` into a self-describing string (includes its salt).
    fn hash(&self, plaintext: &str) -> String;

    /// Check `plaintext` against a hash produced by [`PasswordHasher::hash`].
    fn verify(&self, plaintext: &str, hashed: &str) -> bool;
}
