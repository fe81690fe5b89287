//! Error types for Lodestone
//!
//! This module defines all error types used throughout the engine.
//! Uses `thiserror` for ergonomic error definitions.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidationError {
    /// Model the record was validated against.
    pub model: String,
    /// Offending field name.
    pub field: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl std::fmt::Display for FieldValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}: {}", self.model, self.field, self.message)
    }
}

/// Which access hook blocked an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedKind {
    /// Blocked before the operation ran.
    Pre,
    /// Blocked after data was loaded.
    Post,
}

impl std::fmt::Display for BlockedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockedKind::Pre => write!(f, "pre"),
            BlockedKind::Post => write!(f, "post"),
        }
    }
}

/// Main error type for engine operations
#[derive(Error, Debug, Clone)]
pub enum CrudError {
    /// The database query did not match any document.
    #[error("Document not found")]
    DocumentNotFound,

    /// An insert collided with an existing primary key.
    #[error("Duplicate primary key `{primary_key}`")]
    DuplicatePrimaryKey {
        /// The offending key value.
        primary_key: String,
    },

    /// Any other database-originated failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A caller passed arguments the engine cannot work with.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The query named a model that is not in the schema.
    #[error("Invalid model type: {0}")]
    InvalidModelType(String),

    /// The query shape violated an invariant.
    #[error("Invalid query parameters: {0}")]
    InvalidParams(String),

    /// The requested action is unknown or not permitted in this context.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A record failed model validation.
    #[error("Validation of {model} failed: {}", format_field_errors(.field_errors))]
    Validation {
        /// Model the record was validated against.
        model: String,
        /// First offending field, when there is a single obvious culprit.
        field: Option<String>,
        /// Every accumulated field failure.
        field_errors: Vec<FieldValidationError>,
    },

    /// An access filter denied the invocation or subscription.
    #[error("Access was blocked by the {kind} filter")]
    Blocked {
        /// Which hook denied.
        kind: BlockedKind,
    },

    /// Clients may not publish onto CRUD channels directly.
    #[error("Publishing to CRUD channels is not allowed")]
    PublishNotAllowed,

    /// The engine could not subscribe to a resource channel it needs.
    #[error("Failed to subscribe to resource channel {0}")]
    FailedToSubscribeToResourceChannel(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CrudError>;

fn format_field_errors(errors: &[FieldValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

static DOCUMENT_NOT_FOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^The query did not find a document and returned null").expect("valid regex")
});

static DUPLICATE_PRIMARY_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("Duplicate primary key `([^`]*)`").expect("valid regex"));

impl CrudError {
    /// Classify a raw database error string into the engine taxonomy.
    ///
    /// Driver errors arrive as free text; the two kinds the engine reacts to
    /// are recognised by pattern, everything else becomes [`CrudError::Database`].
    pub fn from_database_message(raw: &str) -> CrudError {
        if DOCUMENT_NOT_FOUND_RE.is_match(raw) {
            return CrudError::DocumentNotFound;
        }
        if let Some(captures) = DUPLICATE_PRIMARY_KEY_RE.captures(raw) {
            return CrudError::DuplicatePrimaryKey {
                primary_key: captures[1].to_string(),
            };
        }
        CrudError::Database(raw.to_string())
    }

    /// Build a validation error for a single field failure.
    pub fn validation_single(model: &str, field: &str, message: impl Into<String>) -> CrudError {
        CrudError::Validation {
            model: model.to_string(),
            field: Some(field.to_string()),
            field_errors: vec![FieldValidationError {
                model: model.to_string(),
                field: field.to_string(),
                message: message.into(),
            }],
        }
    }

    /// True when this error was produced by an access filter.
    pub fn is_blocked(&self) -> bool {
        matches!(self, CrudError::Blocked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_document_not_found() {
        let err = CrudError::from_database_message(
            "The query did not find a document and returned null (404)",
        );
        assert!(matches!(err, CrudError::DocumentNotFound));
    }

    #[test]
    fn test_classify_duplicate_primary_key() {
        let err = CrudError::from_database_message(
            "Duplicate primary key `i1` in table \"Item\": the document already exists",
        );
        match err {
            CrudError::DuplicatePrimaryKey { primary_key } => assert_eq!(primary_key, "i1"),
            other => panic!("expected DuplicatePrimaryKey, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_fallback_is_database() {
        let err = CrudError::from_database_message("Cannot perform write: lost contact with node");
        assert!(matches!(err, CrudError::Database(_)));
    }

    #[test]
    fn test_validation_display_lists_fields() {
        let err = CrudError::Validation {
            model: "Item".to_string(),
            field: Some("qty".to_string()),
            field_errors: vec![FieldValidationError {
                model: "Item".to_string(),
                field: "qty".to_string(),
                message: "expected a number".to_string(),
            }],
        };
        let text = err.to_string();
        assert!(text.contains("Item.qty"), "missing field path in: {text}");
    }
}
