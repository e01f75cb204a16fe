//! Error types for scdflow-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Row does not match the declared dataset schema
    SchemaMismatch,
    /// Cursor, dataset or record not found
    NotFound,
    /// Compare-and-swap precondition failed
    CasConflict,
    /// Transaction errors
    Transaction,
    /// Configuration errors
    Config,
    /// I/O errors
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CasConflict => "cas_conflict",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchemaMismatch, message)
    }

    pub fn cursor_not_found(consumer_id: &str, dataset: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("Cursor not found: {}@{}", consumer_id, dataset),
        )
    }

    /// Cursor moved since it was read. `actual` is the value found in the store.
    pub fn cas_conflict(consumer_id: &str, dataset: &str, expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorKind::CasConflict,
            format!(
                "Cursor {}@{} expected at {} but found {}",
                consumer_id, dataset, expected, actual
            ),
        )
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn is_cas_conflict(&self) -> bool {
        self.kind == ErrorKind::CasConflict
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::Io, format!("IO error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StorageError::cursor_not_found("merge_dimension:customers", "customers");
        let msg = format!("{}", err);
        assert!(msg.contains("not_found"));
        assert!(msg.contains("merge_dimension:customers@customers"));
    }

    #[test]
    fn test_schema_mismatch_error() {
        let err = StorageError::schema_mismatch("missing key column 'customer_id'");
        assert_eq!(err.kind, ErrorKind::SchemaMismatch);
        assert_eq!(
            format!("{}", err),
            "[schema_mismatch] missing key column 'customer_id'"
        );
    }

    #[test]
    fn test_cas_conflict() {
        let err = StorageError::cas_conflict("c1", "orders", 10, 14);
        assert!(err.is_cas_conflict());
        assert!(err.message.contains("expected at 10 but found 14"));
    }

    #[test]
    fn test_io_error_keeps_source() {
        use std::io;

        let err: StorageError = io::Error::new(io::ErrorKind::NotFound, "ledger.db missing").into();

        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.source().unwrap().to_string().contains("ledger.db missing"));
    }

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::Database.as_str(), "database");
        assert_eq!(ErrorKind::CasConflict.as_str(), "cas_conflict");
        assert_eq!(ErrorKind::SchemaMismatch.as_str(), "schema_mismatch");
        assert_eq!(ErrorKind::Io.as_str(), "io");
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();

        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.contains("SQLite error"));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_bad_payload_is_serialization_error() {
        let err: StorageError = serde_json::from_str::<crate::Row>("[1, 2]")
            .map_err(StorageError::from)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(!err.is_cas_conflict());
    }

    #[test]
    fn test_cas_conflict_survives_question_mark() {
        fn advance() -> Result<u64> {
            Err(StorageError::cas_conflict("merge_facts:orders", "orders", 3, 5))
        }

        fn run() -> Result<u64> {
            let to = advance()?;
            Ok(to)
        }

        assert!(run().unwrap_err().is_cas_conflict());
    }
}
