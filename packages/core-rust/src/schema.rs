//! Parameter schemas checked before an action's handler runs.
//!
//! Deliberately small: a flat list of typed fields with an optional flag,
//! nested objects, and minimum string length. Anything richer belongs in the
//! handler.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::FieldViolation;

/// Type rule for a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldRule {
    /// Any JSON value.
    Any,
    /// A string, optionally with a minimum length in characters.
    String { min: Option<usize> },
    /// A string shaped like an email address.
    Email,
    /// Any JSON number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// A JSON object, optionally validated against a nested schema.
    Object { props: Option<ParamSchema> },
}

/// Single field definition within a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Name of the field.
    pub name: String,
    /// Rule the field's value must satisfy.
    pub rule: FieldRule,
    /// Whether the field may be absent (or `null`).
    pub optional: bool,
}

/// Schema for an action's parameter object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    /// Field definitions that comprise this schema.
    pub fields: Vec<FieldDef>,
}

/// Result of validating a value against a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The value conforms to the schema.
    Valid,
    /// The value violates one or more schema constraints.
    Invalid {
        /// One entry per failing field.
        violations: Vec<FieldViolation>,
    },
}

impl ValidationResult {
    /// Whether validation passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles"))
}

impl ParamSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            rule,
            optional: false,
        });
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            rule,
            optional: true,
        });
        self
    }

    /// Validates `value` (expected to be a JSON object) against this schema.
    #[must_use]
    pub fn validate(&self, value: &Value) -> ValidationResult {
        let mut violations = Vec::new();
        self.collect(value, "", &mut violations);
        if violations.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { violations }
        }
    }

    fn collect(&self, value: &Value, prefix: &str, out: &mut Vec<FieldViolation>) {
        let Some(object) = value.as_object() else {
            let field = if prefix.is_empty() { "params" } else { prefix };
            out.push(FieldViolation::new(field, "must be an object"));
            return;
        };

        for def in &self.fields {
            let path = if prefix.is_empty() {
                def.name.clone()
            } else {
                format!("{prefix}.{}", def.name)
            };
            match object.get(&def.name) {
                None | Some(Value::Null) => {
                    if !def.optional {
                        out.push(FieldViolation::new(path, "is required"));
                    }
                }
                Some(field_value) => check_rule(&def.rule, field_value, &path, out),
            }
        }
    }
}

fn check_rule(rule: &FieldRule, value: &Value, path: &str, out: &mut Vec<FieldViolation>) {
    match rule {
        FieldRule::Any => {}
        FieldRule::String { min } => match value.as_str() {
            None => out.push(FieldViolation::new(path, "must be a string")),
            Some(s) => {
                if let Some(min) = min {
                    if s.chars().count() < *min {
                        out.push(FieldViolation::new(
                            path,
                            format!("must be at least {min} characters long"),
                        ));
                    }
                }
            }
        },
        FieldRule::Email => match value.as_str() {
            Some(s) if email_pattern().is_match(s) => {}
            _ => out.push(FieldViolation::new(path, "must be a valid email")),
        },
        FieldRule::Number => {
            if !value.is_number() {
                out.push(FieldViolation::new(path, "must be a number"));
            }
        }
        FieldRule::Boolean => {
            if !value.is_boolean() {
                out.push(FieldViolation::new(path, "must be a boolean"));
            }
        }
        FieldRule::Object { props } => {
            if !value.is_object() {
                out.push(FieldViolation::new(path, "must be an object"));
            } else if let Some(nested) = props {
                nested.collect(value, path, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn entity_schema() -> ParamSchema {
        ParamSchema::new()
            .required("username", FieldRule::String { min: Some(2) })
            .required("password", FieldRule::String { min: Some(6) })
            .required("email", FieldRule::Email)
            .optional("bio", FieldRule::String { min: None })
    }

    #[test]
    fn valid_entity_passes() {
        let value = json!({"username": "ann", "password": "secret1", "email": "a@b.com"});
        assert!(entity_schema().validate(&value).is_valid());
    }

    #[test]
    fn short_password_and_bad_email_both_reported() {
        let value = json!({"username": "ann", "password": "123", "email": "nope"});
        let ValidationResult::Invalid { violations } = entity_schema().validate(&value) else {
            panic!("expected invalid");
        };
        let fields: Vec<_> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["password", "email"]);
    }

    #[test]
    fn missing_required_field() {
        let value = json!({"password": "secret1", "email": "a@b.com"});
        let result = entity_schema().validate(&value);
        assert_eq!(
            result,
            ValidationResult::Invalid {
                violations: vec![FieldViolation::new("username", "is required")]
            }
        );
    }

    #[test]
    fn optional_field_may_be_null() {
        let value = json!({"username": "ann", "password": "secret1", "email": "a@b.com", "bio": null});
        assert!(entity_schema().validate(&value).is_valid());
    }

    #[test]
    fn nested_object_paths_are_dotted() {
        let schema = ParamSchema::new().required(
            "user",
            FieldRule::Object {
                props: Some(
                    ParamSchema::new()
                        .required("email", FieldRule::Email)
                        .required("password", FieldRule::String { min: Some(1) }),
                ),
            },
        );
        let result = schema.validate(&json!({"user": {"email": "x"}}));
        let ValidationResult::Invalid { violations } = result else {
            panic!("expected invalid");
        };
        assert_eq!(violations[0].field, "user.email");
        assert_eq!(violations[1], FieldViolation::new("user.password", "is required"));
    }

    #[test]
    fn non_object_params_rejected() {
        let result = ParamSchema::new().validate(&json!("string"));
        assert!(!result.is_valid());
    }

    proptest! {
        #[test]
        fn string_min_length_matches_char_count(s in "\\PC{0,12}", min in 0usize..8) {
            let schema = ParamSchema::new().required("v", FieldRule::String { min: Some(min) });
            let valid = schema.validate(&json!({"v": s.clone()})).is_valid();
            prop_assert_eq!(valid, s.chars().count() >= min);
        }
    }
}
