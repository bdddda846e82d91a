//! Token signing and password hashing behind the capability traits in
//! [`crate::traits`].

pub mod password;
pub mod token;

pub use password::SaltedSha256Hasher;
pub use token::JwtCodec;
