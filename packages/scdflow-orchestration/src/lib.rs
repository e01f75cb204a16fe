/*
 * scdflow Orchestration - incremental ELT core
 *
 * Turns per-dataset change ledgers into a history-preserving warehouse.
 *
 * Architecture:
 * - Change Ledger (append-only, CAS consumer cursors)
 * - SCD2 Merge Engine (versioned dimensions, compensating fact rows)
 * - Aggregate Maintainer (bucket-level incremental refresh)
 * - Validation Gate (batch accept/reject before commit)
 * - Task Orchestrator (DAG phases, leases, retry, BLOCKED, backfill)
 */

// Public modules
pub mod aggregate;
pub mod anomaly;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod dag;
pub mod error;
pub mod job;
pub mod lease;
pub mod ledger;
pub mod merge;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod services;
pub mod telemetry;
pub mod validation;

// Re-exports
pub use aggregate::{AggregateFunc, AggregateMaintainer, AggregateSpec, GroupBy, MeasureSpec, RefreshReport};
pub use anomaly::{AnomalyReporter, AnomalySink, ChannelAnomalySink, MemoryAnomalySink, TracingAnomalySink};
pub use catalog::{CatalogReader, CatalogSnapshot, SinkCatalog};
pub use config::{
    ConfigError, DatasetConfig, DatasetKind, DimensionReference, EngineConfig, OrchestratorConfig,
    ScdflowConfig,
};
pub use cursor::CursorManager;
pub use dag::{TaskDag, TaskKind, TaskNode};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use job::{RetryPolicy, RunLedger, TaskId, TaskRecord, TaskRun, TaskState, TaskStatus, Tick};
pub use lease::{Lease, LeaseTable};
pub use ledger::{AppendReport, ChangeLedger, ChangeReader};
pub use merge::{DatasetMapping, MergeEngine, MergeOutcome, StagedMerge};
pub use orchestrator::{
    BackfillReport, BackfillRequest, SequenceRange, TaskOrchestrator, TaskReport, TickReport,
    TriggerOutcome,
};
pub use pipeline::{AggregateTask, BatchContext, BatchOutput, CommitGuard, MergeTask, TaskHandler};
pub use services::CoreServices;
pub use telemetry::init_tracing;
pub use validation::{ValidationGate, ValidationRule, Verdict, Violation};
