//! Error types for the transfer library.

use std::time::Duration;

use thiserror::Error;

use crate::credentials::WarehouseKind;

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Configuration error (invalid YAML, bad request, unknown warehouse kind, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential map is missing required fields for its warehouse kind.
    #[error("Missing credential fields for {kind}: {}", .missing.join(", "))]
    MissingCredentialFields {
        kind: WarehouseKind,
        missing: Vec<String>,
    },

    /// Credential field is present but malformed.
    #[error("Invalid credential field '{field}' for {kind}: {message}")]
    InvalidCredential {
        kind: WarehouseKind,
        field: String,
        message: String,
    },

    /// Network or authentication failure while opening or using a session.
    #[error("Connection error ({kind}): {message}")]
    Connection {
        kind: WarehouseKind,
        message: String,
    },

    /// Statement rejected by the backend.
    #[error("Query error ({kind}): {message}")]
    Query {
        kind: WarehouseKind,
        message: String,
        transient: bool,
    },

    /// Extracted rows cannot be turned into a destination schema.
    #[error("Schema error for table {table}: {message}")]
    Schema { table: String, message: String },

    /// Job registry persistence failure.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Unknown job or source id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A job with this id is already running.
    #[error("Job {0} is already running")]
    DuplicateJob(String),

    /// A step exceeded its timeout.
    #[error("Step '{step}' timed out after {after:?}")]
    Timeout { step: String, after: Duration },

    /// The job or step was cancelled.
    #[error("Transfer cancelled")]
    Cancelled,

    /// The engine shut down mid-job; the job stays resumable.
    #[error("Job {0} interrupted by shutdown")]
    Interrupted(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error classes used for retry decisions and user-visible status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Query,
    Schema,
    Registry,
    Cancelled,
    Other,
}

impl TransferError {
    /// Create a Connection error.
    pub fn connection(kind: WarehouseKind, message: impl Into<String>) -> Self {
        TransferError::Connection {
            kind,
            message: message.into(),
        }
    }

    /// Create a Query error that is not worth retrying.
    pub fn query(kind: WarehouseKind, message: impl Into<String>) -> Self {
        TransferError::Query {
            kind,
            message: message.into(),
            transient: false,
        }
    }

    /// Create a Query error the driver classified as transient.
    pub fn transient_query(kind: WarehouseKind, message: impl Into<String>) -> Self {
        TransferError::Query {
            kind,
            message: message.into(),
            transient: true,
        }
    }

    /// Create a Schema error.
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Registry error.
    pub fn registry(message: impl std::fmt::Display) -> Self {
        TransferError::Registry(message.to_string())
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::Config(_)
            | TransferError::MissingCredentialFields { .. }
            | TransferError::InvalidCredential { .. }
            | TransferError::Yaml(_) => ErrorCategory::Configuration,
            TransferError::Connection { .. } => ErrorCategory::Connection,
            TransferError::Query { .. } => ErrorCategory::Query,
            TransferError::Schema { .. } => ErrorCategory::Schema,
            TransferError::Registry(_) | TransferError::DuplicateJob(_) => ErrorCategory::Registry,
            TransferError::Timeout { .. }
            | TransferError::Cancelled
            | TransferError::Interrupted(_) => ErrorCategory::Cancelled,
            TransferError::NotFound(_) | TransferError::Io(_) | TransferError::Json(_) => {
                ErrorCategory::Other
            }
        }
    }

    /// Configuration errors are never transient and abort a job before any table is attempted.
    pub fn is_configuration(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// Whether a step that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Connection { .. } | TransferError::Timeout { .. } => true,
            TransferError::Query { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            TransferError::Io(_) => 7,
            _ => match self.category() {
                ErrorCategory::Configuration => 1,
                ErrorCategory::Connection => 2,
                ErrorCategory::Query => 3,
                ErrorCategory::Schema => 4,
                ErrorCategory::Registry => 5,
                ErrorCategory::Cancelled => 6,
                ErrorCategory::Other => 8,
            },
        }
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_message_lists_keys() {
        let err = TransferError::MissingCredentialFields {
            kind: WarehouseKind::Postgres,
            missing: vec!["user".into(), "password".into()],
        };
        assert_eq!(
            err.to_string(),
            "Missing credential fields for postgres: user, password"
        );
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        assert!(TransferError::connection(WarehouseKind::Clickhouse, "refused").is_retryable());
        assert!(TransferError::transient_query(WarehouseKind::Postgres, "deadlock").is_retryable());
        assert!(!TransferError::query(WarehouseKind::Postgres, "syntax").is_retryable());
        assert!(!TransferError::schema("users", "mixed rows").is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(!TransferError::Interrupted("job-1".into()).is_retryable());
        assert!(TransferError::Timeout {
            step: "list_tables".into(),
            after: Duration::from_secs(1),
        }
        .is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TransferError::Config("bad".into()).exit_code(), 1);
        assert_eq!(
            TransferError::connection(WarehouseKind::Snowflake, "x").exit_code(),
            2
        );
        assert_eq!(TransferError::schema("t", "x").exit_code(), 4);
        assert_eq!(TransferError::Interrupted("job-1".into()).exit_code(), 6);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(TransferError::Io(io).exit_code(), 7);
    }
}
