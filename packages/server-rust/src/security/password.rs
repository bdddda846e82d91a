//! Salted, iterated SHA-256 implementation of [`PasswordHasher`].
//!
//! Hash format: `sha256$<rounds>$<salt hex>$<digest hex>`.

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::traits::PasswordHasher;

const SALT_LEN: usize = 16;
const DEFAULT_ROUNDS: u32 = 4096;
/// Hashes claiming more rounds than this are refused rather than computed.
pub const MAX_ROUNDS: u32 = 1 << 20;

/// Password hasher using a random per-password salt and repeated SHA-256.
#[derive(Debug, Clone)]
pub struct SaltedSha256Hasher {
    rounds: u32,
}

impl SaltedSha256Hasher {
    #[must_use]
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds: rounds.clamp(1, MAX_ROUNDS),
        }
    }

    fn digest(salt: &[u8], plaintext: &str, rounds: u32) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(plaintext.as_bytes());
        let mut out: [u8; 32] = hasher.finalize().into();
        for _ in 1..rounds {
            let mut hasher = Sha256::new();
            hasher.update(salt);
            hasher.update(out);
            out = hasher.finalize().into();
        }
        out
    }
}

impl Default for SaltedSha256Hasher {
    fn default() -> Self {
        Self::new(DEFAULT_ROUNDS)
    }
}

impl PasswordHasher for SaltedSha256Hasher {
    fn hash(&self, plaintext: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill(&mut salt);
        let digest = Self::digest(&salt, plaintext, self.rounds);
        format!(
            "sha256${}${}${}",
            self.rounds,
            hex::encode(salt),
            hex::encode(digest)
        )
    }

    fn verify(&self, plaintext: &str, hashed: &str) -> bool {
        let mut parts = hashed.split('$');
        let (Some("sha256"), Some(rounds), Some(salt), Some(expected), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return false;
        };
        let (Ok(rounds), Ok(salt), Ok(expected)) =
            (rounds.parse::<u32>(), hex::decode(salt), hex::decode(expected))
        else {
            return false;
        };
        if rounds == 0 || rounds > MAX_ROUNDS {
            return false;
        }
        let actual = Self::digest(&salt, plaintext, rounds);
        actual.ct_eq(expected.as_slice()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_differs_from_plaintext_and_verifies() {
        let hasher = SaltedSha256Hasher::new(8);
        let hashed = hasher.hash("secret1");
        assert_ne!(hashed, "secret1");
        assert!(hashed.starts_with("sha256$8$"));
        assert!(hasher.verify("secret1", &hashed));
        assert!(!hasher.verify("secret2", &hashed));
    }

    #[test]
    fn salts_make_hashes_unique() {
        let hasher = SaltedSha256Hasher::new(1);
        assert_ne!(hasher.hash("same"), hasher.hash("same"));
    }

    #[test]
    fn rounds_are_read_from_the_hash() {
        let hashed = SaltedSha256Hasher::new(3).hash("pw");
        assert!(SaltedSha256Hasher::new(100).verify("pw", &hashed));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        let hasher = SaltedSha256Hasher::default();
        assert!(!hasher.verify("pw", "pw"));
        assert!(!hasher.verify("pw", "sha256$x$00$00"));
        assert!(!hasher.verify("pw", "md5$1$00$00"));
    }

    #[test]
    fn excessive_round_counts_are_refused() {
        let hashed = SaltedSha256Hasher::new(2).hash("pw");
        let salt_and_digest = hashed.trim_start_matches("sha256$2$");
        let hostile = format!("sha256${}${salt_and_digest}", u32::MAX);
        assert!(!SaltedSha256Hasher::default().verify("pw", &hostile));

        let zero = format!("sha256$0${salt_and_digest}");
        assert!(!SaltedSha256Hasher::default().verify("pw", &zero));
        assert!(hashed.starts_with("sha256$2$"));
    }

    #[test]
    fn configured_rounds_are_clamped() {
        assert_eq!(SaltedSha256Hasher::new(u32::MAX).rounds, MAX_ROUNDS);
        assert_eq!(SaltedSha256Hasher::new(0).rounds, 1);
    }
}
