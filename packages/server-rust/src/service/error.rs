//! Failure taxonomy for action invocations.

use std::sync::Arc;

use conduit_core::{ActionId, FieldViolation};
use serde::{Deserialize, Serialize};

/// Errors surfaced by the action pipeline.
///
/// `Clone` so the hook chain can keep the original failure while an
/// error-hook inspects it; the `Internal` variant shares its source via `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("action not found: {id}")]
    ActionNotFound { id: ActionId },
    #[error("action already registered: {id}")]
    DuplicateAction { id: ActionId },
    #[error("{message}")]
    Validation {
        message: String,
        violations: Vec<FieldViolation>,
    },
    #[error("authentication token is missing")]
    MissingToken,
    #[error("authentication token is invalid: {reason}")]
    InvalidToken { reason: String },
    #[error("authentication token has expired")]
    ExpiredToken,
    #[error("{message}")]
    DuplicateEntity {
        message: String,
        violations: Vec<FieldViolation>,
    },
    #[error("{message}")]
    InvalidCredentials {
        message: String,
        violations: Vec<FieldViolation>,
    },
    #[error("entity not found: {id}")]
    EntityNotFound { id: String },
    #[error("hook contract violated: {detail}")]
    HookContractViolation { detail: String },
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("broker overloaded, try again later")]
    Overloaded,
    #[error("internal error: {0}")]
    Internal(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(Arc::new(err))
    }
}

/// Discriminant of [`ActionError`], stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ActionNotFound,
    DuplicateAction,
    Validation,
    MissingToken,
    InvalidToken,
    ExpiredToken,
    DuplicateEntity,
    InvalidCredentials,
    EntityNotFound,
    HookContractViolation,
    Timeout,
    Overloaded,
    Internal,
}

impl ActionError {
    /// Builds a validation error from field violations.
    #[must_use]
    pub fn validation(violations: Vec<FieldViolation>) -> Self {
        Self::Validation {
            message: "Parameters validation error!".to_string(),
            violations,
        }
    }

    /// Builds a uniqueness violation for a single field.
    #[must_use]
    pub fn duplicate_entity(message: impl Into<String>, field: &str) -> Self {
        Self::DuplicateEntity {
            message: message.into(),
            violations: vec![FieldViolation::new(field, "is exist")],
        }
    }

    /// The error's kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ActionNotFound { .. } => ErrorKind::ActionNotFound,
            Self::DuplicateAction { .. } => ErrorKind::DuplicateAction,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::MissingToken => ErrorKind::MissingToken,
            Self::InvalidToken { .. } => ErrorKind::InvalidToken,
            Self::ExpiredToken => ErrorKind::ExpiredToken,
            Self::DuplicateEntity { .. } => ErrorKind::DuplicateEntity,
            Self::InvalidCredentials { .. } => ErrorKind::InvalidCredentials,
            Self::EntityNotFound { .. } => ErrorKind::EntityNotFound,
            Self::HookContractViolation { .. } => ErrorKind::HookContractViolation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Overloaded => ErrorKind::Overloaded,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Field-level violations, empty for errors that carry none.
    #[must_use]
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            Self::Validation { violations, .. }
            | Self::DuplicateEntity { violations, .. }
            | Self::InvalidCredentials { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Caller-facing rendering of an unrecovered error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<FieldViolation>,
}

impl From<&ActionError> for ErrorPayload {
    fn from(err: &ActionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            data: err.violations().to_vec(),
        }
    }
}
