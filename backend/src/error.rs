//! Error types for the catalog import/export engine.
//!
//! - [`CsvError`] - file-level problems (unreadable, empty, no header)
//! - [`ConfigError`] - invalid field maps or engine configuration
//! - [`StorageError`] - failures reported by a [`crate::storage::CatalogStore`]
//! - [`RowError`] - a single row could not be applied
//! - [`SessionError`] - illegal import session transitions
//! - [`ImportError`] - top-level orchestration errors
//! - [`ExportError`] - export streaming errors
//! - [`ServerError`] - HTTP layer errors
//!
//! Row-level errors never escape the orchestrator: they are recorded on the
//! session. Everything else converts upward via `From`, so `?` works across
//! error boundaries.

use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionStatus;

// =============================================================================
// CSV File Errors
// =============================================================================

/// Errors that prevent a file from being read at all.
#[derive(Debug, Error)]
pub enum CsvError {
    /// Failed to read the file.
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed CSV.
    #[error("Invalid CSV at line {line}: {message}")]
    Parse { line: u64, message: String },

    /// Empty file.
    #[error("CSV file is empty")]
    EmptyFile,

    /// No header row.
    #[error("No headers found in CSV")]
    NoHeaders,
}

impl From<csv::Error> for CsvError {
    fn from(err: csv::Error) -> Self {
        let line = err.position().map(|p| p.line()).unwrap_or(0);
        match err.into_kind() {
            csv::ErrorKind::Io(io) => CsvError::Io(io),
            other => CsvError::Parse {
                line,
                message: format!("{:?}", other),
            },
        }
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Errors in a field map or engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Two columns map onto the same internal field.
    #[error("Internal field '{field}' is mapped by both '{first}' and '{second}'")]
    DuplicateField {
        field: String,
        first: String,
        second: String,
    },

    /// The same external column is declared twice.
    #[error("Column '{0}' is declared more than once")]
    DuplicateColumn(String),

    /// A separator must be non-empty.
    #[error("Separator for '{0}' must not be empty")]
    EmptySeparator(String),

    /// A numeric option is out of its allowed range.
    #[error("Invalid value for '{name}': {message}")]
    InvalidValue { name: String, message: String },

    /// Could not read the configuration file.
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not parse the configuration file.
    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Errors reported by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// A natural key is already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transaction misuse (commit without begin, nested begin...).
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Any other backend failure.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Snapshot file IO.
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file encoding.
    #[error("Storage JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Row Errors
// =============================================================================

/// Why a single data row could not be applied.
#[derive(Debug, Error)]
pub enum RowError {
    /// Row failed semantic validation.
    #[error("{message}")]
    Invalid {
        field: Option<String>,
        message: String,
    },

    /// Storage failed while applying the row.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RowError {
    /// The field the error is attributed to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            RowError::Invalid { field, .. } => field.as_deref(),
            RowError::Storage(_) => None,
        }
    }
}

// =============================================================================
// Session Errors
// =============================================================================

/// Illegal operations on an import session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested status change is not part of the state machine.
    #[error("Cannot move session from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// Terminal sessions are immutable.
    #[error("Session is {0} and can no longer change")]
    Terminal(SessionStatus),

    /// Unknown session id.
    #[error("Session not found: {0}")]
    NotFound(Uuid),
}

// =============================================================================
// Import Errors (top-level)
// =============================================================================

/// Top-level orchestration errors.
///
/// These end a run as `failed`; per-row problems never surface here.
#[derive(Debug, Error)]
pub enum ImportError {
    /// File could not be read.
    #[error("CSV error: {0}")]
    Csv(#[from] CsvError),

    /// Header validation failed.
    #[error("Header validation failed: {}", .0.join("; "))]
    InvalidHeaders(Vec<String>),

    /// Session state machine violation.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Storage failed outside of a row transaction.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration problem.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

// =============================================================================
// Export Errors
// =============================================================================

/// Errors while streaming an export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Storage query failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// CSV writer failed.
    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),

    /// Output sink failed.
    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),

    /// A requested column is not in the field map.
    #[error("Unknown export column '{0}'")]
    UnknownColumn(String),
}

// =============================================================================
// Server Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Import failed before any row was processed.
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// Export failed.
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Unknown resource.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server internal error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for CSV reading.
pub type CsvResult<T> = Result<T, CsvError>;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for a single row.
pub type RowResult<T> = Result<T, RowError>;

/// Result type for session transitions.
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type for import orchestration.
pub type ImportResult<T> = Result<T, ImportError>;

/// Result type for exports.
pub type ExportResult<T> = Result<T, ExportError>;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
