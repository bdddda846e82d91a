//! Conduit server: a service broker that runs named actions through an
//! auth gate, parameter validation, a response cache and a hook chain.

pub mod security;
pub mod service;
pub mod storage;
pub mod traits;

pub use service::{ActionError, ErrorPayload, ServerConfig, ServiceBroker, ServiceContext};
pub use traits::{EntityStore, PasswordHasher, TokenClaims, TokenCodec, TokenError};
