use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully qualified name of an action: `(service, action)`.
///
/// Displays as `service.action`, the same dotted form callers use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId {
    /// Name of the owning service (e.g. `"users"`).
    pub service: String,
    /// Name of the action within the service (e.g. `"create"`).
    pub action: String,
}

impl ActionId {
    /// Builds an action id from its two parts.
    #[must_use]
    pub fn new(service: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.action)
    }
}

/// Verified caller identity produced by resolving a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Subject id (the user id the token was issued for).
    pub id: String,
    /// Display name carried in the token claims.
    pub username: String,
    /// Token expiry, seconds since Unix epoch.
    pub expires_at: u64,
}

impl Identity {
    /// Whether the identity is past its expiry at `now_secs`.
    #[must_use]
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at
    }
}

/// A single field-level violation reported with validation and business errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Dotted path of the offending field (e.g. `"user.email"`).
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl FieldViolation {
    /// Creates a violation for `field`.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_id_displays_dotted() {
        assert_eq!(ActionId::new("users", "create").to_string(), "users.create");
    }

    #[test]
    fn identity_expiry_is_inclusive() {
        let identity = Identity {
            id: "u1".to_string(),
            username: "ann".to_string(),
            expires_at: 100,
        };
        assert!(!identity.is_expired(99));
        assert!(identity.is_expired(100));
    }

    #[test]
    fn field_violation_serializes_as_pair() {
        let v = FieldViolation::new("username", "is exist");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json, serde_json::json!({"field": "username", "message": "is exist"}));
    }
}
