//! Record-layer errors

use std::collections::BTreeMap;

use recordstore::BackendError;
use thiserror::Error;

/// Field name used for errors that are not tied to one column
pub const BASE: &str = "base";

/// Errors surfaced by queries, mutations and reactive wrappers
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Couldn't find {table} with id={id}")]
    RecordNotFound { table: String, id: String },

    #[error("Validation failed: {}", full_messages(.errors))]
    RecordInvalid {
        table: String,
        errors: BTreeMap<String, Vec<String>>,
    },

    #[error("Unknown relationship '{relation}' on {table} (declared: {declared})")]
    Relationship {
        table: String,
        relation: String,
        declared: String,
    },

    #[error("Stale {table}/{id}: expected lock_version {expected}, found {actual}")]
    Conflict {
        table: String,
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Backend error: {0}")]
    Backend(#[source] BackendError),

    #[error("Client not initialized: connect a backend before issuing queries")]
    ClientNotInitialized,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0} has been destroyed")]
    Destroyed(&'static str),
}

/// Result alias for record operations
pub type RecordResult<T> = Result<T, RecordError>;

fn full_messages(errors: &BTreeMap<String, Vec<String>>) -> String {
    errors.values().flatten().cloned().collect::<Vec<_>>().join(", ")
}

impl RecordError {
    /// Single-message validation error
    pub fn invalid(table: &str, field: &str, message: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Self::RecordInvalid {
            table: table.to_string(),
            errors,
        }
    }

    pub fn not_found(table: &str, id: &str) -> Self {
        Self::RecordNotFound {
            table: table.to_string(),
            id: id.to_string(),
        }
    }

    /// Messages attached to `field` (empty for other variants)
    pub fn errors_on(&self, field: &str) -> Vec<String> {
        match self {
            Self::RecordInvalid { errors, .. } => errors.get(field).cloned().unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::RecordInvalid { .. })
    }

    /// Failures the reactive layer retries before settling into an error state
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_transient(),
            Self::ClientNotInitialized => true,
            _ => false,
        }
    }
}

impl From<BackendError> for RecordError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound { table, id } => Self::RecordNotFound { table, id },
            BackendError::Conflict {
                table,
                id,
                expected,
                actual,
            } => Self::Conflict {
                table,
                id,
                expected,
                actual,
            },
            other => Self::Backend(other),
        }
    }
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(BackendError::Serialization(err))
    }
}

/// Accumulates field errors before raising a single [`RecordError::RecordInvalid`]
#[derive(Debug, Default)]
pub(crate) struct Errors {
    errors: BTreeMap<String, Vec<String>>,
}

impl Errors {
    pub(crate) fn add(&mut self, field: &str, message: impl Into<String>) {
        self.errors.entry(field.to_string()).or_default().push(message.into());
    }

    pub(crate) fn into_result(self, table: &str) -> RecordResult<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(RecordError::RecordInvalid {
            table: table.to_string(),
            errors: self.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_display_lists_messages() {
        let mut errors = Errors::default();
        errors.add("title", "Title is required");
        errors.add("client_id", "Client is required");
        let err = errors.into_result("jobs").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Title is required"));
        assert!(msg.contains("Client is required"));
        assert_eq!(err.errors_on("title"), vec!["Title is required".to_string()]);
    }

    #[test]
    fn test_backend_not_found_maps_to_record_not_found() {
        let err: RecordError = BackendError::NotFound {
            table: "jobs".into(),
            id: "x".into(),
        }
        .into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_backend_conflict_maps_to_conflict() {
        let err: RecordError = BackendError::Conflict {
            table: "jobs".into(),
            id: "x".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(matches!(err, RecordError::Conflict { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RecordError::Backend(BackendError::Unavailable("down".into())).is_transient());
        assert!(RecordError::ClientNotInitialized.is_transient());
        assert!(!RecordError::invalid("jobs", BASE, "nope").is_transient());
        assert!(!RecordError::not_found("jobs", "x").is_transient());
    }

    #[test]
    fn test_empty_errors_is_ok() {
        assert!(Errors::default().into_result("jobs").is_ok());
    }
}
