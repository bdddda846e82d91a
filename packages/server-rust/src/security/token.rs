//! HS256 JWT implementation of [`TokenCodec`].

use std::collections::HashSet;

use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::traits::{TokenClaims, TokenCodec, TokenError};

/// JWT codec keyed by a shared HMAC secret.
///
/// Expiry is not validated here; the auth gate compares `exp` against its
/// injected clock so time can be controlled in tests.
pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtCodec {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::from(["exp".to_string()]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Decodes the payload without checking the signature.
    fn peek_claims(token: &str) -> Option<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()
            .map(|data| data.claims)
    }
}

impl TokenCodec for JwtCodec {
    fn sign(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|error| TokenError::Signing(error.to_string()))
    }

    fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        match jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(error) => match error.kind() {
                JwtErrorKind::InvalidSignature => Err(TokenError::InvalidSignature {
                    claims: Self::peek_claims(token),
                }),
                _ => Err(TokenError::Malformed(error.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: u64) -> TokenClaims {
        TokenClaims {
            id: "u-1".to_string(),
            username: "ann".to_string(),
            exp,
            iat: 1,
        }
    }

    #[test]
    fn sign_then_verify_returns_claims() {
        let codec = JwtCodec::new("jwt-conduit-secret");
        let token = codec.sign(&claims(4_000_000_000)).unwrap();
        assert_eq!(codec.verify(&token).unwrap(), claims(4_000_000_000));
    }

    #[test]
    fn expired_claims_still_verify_signature() {
        // Expiry is the gate's concern; the codec only checks the signature.
        let codec = JwtCodec::new("s");
        let token = codec.sign(&claims(10)).unwrap();
        assert_eq!(codec.verify(&token).unwrap().exp, 10);
    }

    #[test]
    fn wrong_secret_reports_invalid_signature_with_claims() {
        let token = JwtCodec::new("one").sign(&claims(99)).unwrap();
        let err = JwtCodec::new("two").verify(&token).unwrap_err();
        match err {
            TokenError::InvalidSignature { claims: Some(c) } => assert_eq!(c.exp, 99),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let err = JwtCodec::new("s").verify("not-a-jwt").unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
    }
}
