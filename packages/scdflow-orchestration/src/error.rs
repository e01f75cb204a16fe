use scdflow_storage::{ErrorKind, StorageError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::job::{TaskId, Tick};
use crate::validation::Violation;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Row did not match the declared dataset schema
    #[error("Schema mismatch in {dataset}: {reason}")]
    SchemaMismatch { dataset: String, reason: String },

    /// Update/delete whose predecessor never arrived
    #[error("Orphan event {sequence_id} in {dataset} for key {key}")]
    OrphanEvent {
        dataset: String,
        sequence_id: u64,
        key: String,
    },

    #[error("Validation rejected batch for {dataset}: {} violation(s)", violations.len())]
    ValidationRejected {
        dataset: String,
        violations: Vec<Violation>,
    },

    /// Optimistic commit lost a race (merge watermark or cursor moved)
    #[error("Merge conflict on {dataset}: {reason}")]
    MergeConflict { dataset: String, reason: String },

    #[error("Lease lost for {task_id}@{tick}: {reason}")]
    LeaseLost {
        task_id: TaskId,
        tick: Tick,
        reason: String,
    },

    #[error("Task {task_id}@{tick} blocked after {attempts} attempts")]
    TaskBlocked {
        task_id: TaskId,
        tick: Tick,
        attempts: u32,
    },

    #[error("Task run cancelled")]
    Cancelled,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("DAG cycle detected")]
    DagCycleDetected,

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Retry classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::MergeConflict { .. }
            | OrchestratorError::LeaseLost { .. }
            | OrchestratorError::Cancelled => ErrorCategory::Transient,

            OrchestratorError::Storage(e) => match e.kind {
                ErrorKind::CasConflict | ErrorKind::Database | ErrorKind::Transaction => {
                    ErrorCategory::Transient
                }
                ErrorKind::Io => ErrorCategory::Infrastructure,
                ErrorKind::Serialization
                | ErrorKind::SchemaMismatch
                | ErrorKind::NotFound
                | ErrorKind::Config => ErrorCategory::Permanent,
            },

            OrchestratorError::Io(_) => ErrorCategory::Infrastructure,

            OrchestratorError::Other(_) => ErrorCategory::Transient, // Default to retry

            OrchestratorError::Configuration(_)
            | OrchestratorError::SchemaMismatch { .. }
            | OrchestratorError::OrphanEvent { .. }
            | OrchestratorError::ValidationRejected { .. }
            | OrchestratorError::TaskBlocked { .. }
            | OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::TaskNotFound(_)
            | OrchestratorError::UnknownDataset(_)
            | OrchestratorError::DagCycleDetected
            | OrchestratorError::MissingDependency(_)
            | OrchestratorError::Serialization(_)
            | OrchestratorError::Parse(_)
            | OrchestratorError::Config(_) => ErrorCategory::Permanent,
        }
    }

    /// Short machine-readable reason recorded on failed task runs
    pub fn reason_code(&self) -> &'static str {
        match self {
            OrchestratorError::Storage(_) => "storage",
            OrchestratorError::Configuration(_) | OrchestratorError::Config(_) => "config",
            OrchestratorError::SchemaMismatch { .. } => "schema_mismatch",
            OrchestratorError::OrphanEvent { .. } => "orphan_event",
            OrchestratorError::ValidationRejected { .. } => "validation_rejected",
            OrchestratorError::MergeConflict { .. } => "merge_conflict",
            OrchestratorError::LeaseLost { .. } => "lease_lost",
            OrchestratorError::TaskBlocked { .. } => "task_blocked",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::InvalidStateTransition { .. } => "invalid_state_transition",
            OrchestratorError::TaskNotFound(_) => "task_not_found",
            OrchestratorError::UnknownDataset(_) => "unknown_dataset",
            OrchestratorError::DagCycleDetected => "dag_cycle",
            OrchestratorError::MissingDependency(_) => "missing_dependency",
            OrchestratorError::Serialization(_) => "serialization",
            OrchestratorError::Parse(_) => "parse",
            OrchestratorError::Io(_) => "io",
            OrchestratorError::Other(_) => "other",
        }
    }

    /// Violations carried by a rejected batch
    pub fn violations(&self) -> &[Violation] {
        match self {
            OrchestratorError::ValidationRejected { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., merge conflict, lost lease)
    Transient,
    /// Permanent error - don't retry (e.g., rejected batch, bad config)
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    /// Whether the orchestrator schedules another attempt on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Infrastructure)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let s = category.as_str();
            let parsed = ErrorCategory::from_str(s).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_classification() {
        let conflict = OrchestratorError::MergeConflict {
            dataset: "customers".to_string(),
            reason: "watermark moved".to_string(),
        };
        assert_eq!(conflict.category(), ErrorCategory::Transient);
        assert_eq!(OrchestratorError::Cancelled.category(), ErrorCategory::Transient);

        let rejected = OrchestratorError::ValidationRejected {
            dataset: "orders".to_string(),
            violations: vec![],
        };
        assert_eq!(rejected.category(), ErrorCategory::Permanent);
        assert!(!rejected.category().is_retryable());

        let cas: OrchestratorError = StorageError::cas_conflict("c", "d", 1, 2).into();
        assert_eq!(cas.category(), ErrorCategory::Transient);

        let bad_row: OrchestratorError = StorageError::schema_mismatch("missing key").into();
        assert_eq!(bad_row.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_reason_code() {
        assert_eq!(OrchestratorError::Cancelled.reason_code(), "cancelled");
        let lost = OrchestratorError::LeaseLost {
            task_id: TaskId::new("merge_dimension:customers"),
            tick: Tick(3),
            reason: "expired".to_string(),
        };
        assert_eq!(lost.reason_code(), "lease_lost");
        assert!(lost.to_string().contains("merge_dimension:customers@3"));
    }
}
