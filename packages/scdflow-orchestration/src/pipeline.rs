use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scdflow_storage::{Anomaly, AnomalyKind, ChangeEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::CatalogReader;
use crate::error::{OrchestratorError, Result};
use crate::job::TaskId;
use crate::lease::{Lease, LeaseTable};
use crate::services::CoreServices;
use crate::validation::Verdict;

/// Lease and cancellation checks at batch boundaries
pub struct CommitGuard {
    leases: Arc<LeaseTable>,
    lease: Mutex<Lease>,
    ttl: Duration,
    cancel: CancellationToken,
}

impl CommitGuard {
    pub fn new(leases: Arc<LeaseTable>, lease: Lease, ttl: Duration, cancel: CancellationToken) -> Self {
        Self {
            leases,
            lease: Mutex::new(lease),
            ttl,
            cancel,
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        Ok(())
    }

    /// Extend the lease; `LeaseLost` if it expired or changed hands
    pub fn renew(&self) -> Result<()> {
        let mut lease = self.lease.lock();
        *lease = self.leases.renew(&lease, self.ttl)?;
        Ok(())
    }

    /// Last check before a write becomes visible
    pub fn confirm(&self) -> Result<()> {
        self.check_cancelled()?;
        self.renew()
    }

    pub fn lease(&self) -> Lease {
        self.lease.lock().clone()
    }

    pub fn release(&self) -> bool {
        self.leases.release(&self.lease.lock())
    }
}

/// Per-batch context passed to handlers
pub struct BatchContext<'a> {
    pub services: &'a CoreServices,
    pub guard: &'a CommitGuard,
    /// Cursor position before this batch
    pub cursor: u64,
    pub as_of: DateTime<Utc>,
}

/// What one batch did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub events_applied: usize,
    pub anomalies: usize,
}

/// Task handler trait (one per DAG node)
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_id(&self) -> &TaskId;

    /// Dataset whose ledger this task consumes
    fn dataset(&self) -> &str;

    /// Highest sequence id the task may read right now
    async fn read_bound(&self, services: &CoreServices) -> Result<u64>;

    /// Sequence id the task's output already covers, if it tracks one.
    /// A cursor behind it is fast-forwarded before reading.
    fn committed_through(&self, _services: &CoreServices) -> Option<u64> {
        None
    }

    /// Whether an attempt with nothing to read still processes one empty batch
    fn runs_on_empty_batch(&self, _services: &CoreServices) -> bool {
        false
    }

    /// Apply one batch. Must call `ctx.guard.confirm()` right before committing.
    async fn process_batch(&self, events: &[ChangeEvent], ctx: &BatchContext<'_>) -> Result<BatchOutput>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Merge task
// ═══════════════════════════════════════════════════════════════════════════

/// validate → prepare → confirm lease → commit → report anomalies
pub struct MergeTask {
    task_id: TaskId,
    dataset: String,
}

impl MergeTask {
    pub fn new(task_id: TaskId, dataset: impl Into<String>) -> Self {
        Self {
            task_id,
            dataset: dataset.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for MergeTask {
    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    async fn read_bound(&self, services: &CoreServices) -> Result<u64> {
        services.ledger.head(&self.dataset).await
    }

    fn committed_through(&self, services: &CoreServices) -> Option<u64> {
        Some(services.engine.applied_through(&self.dataset))
    }

    fn runs_on_empty_batch(&self, services: &CoreServices) -> bool {
        // Orphans age once per batch
        !services.catalog.pending_orphans(&self.dataset).is_empty()
    }

    async fn process_batch(&self, events: &[ChangeEvent], ctx: &BatchContext<'_>) -> Result<BatchOutput> {
        let services = ctx.services;
        let mapping = services.mapping(&self.dataset)?;

        if let Verdict::Rejected(violations) =
            services.gate.evaluate(&services.rules(&self.dataset), events)
        {
            warn!(
                task_id = %self.task_id,
                dataset = %self.dataset,
                violations = violations.len(),
                "Batch rejected by validation gate"
            );
            let anomaly = Anomaly::new(
                AnomalyKind::ValidationRejected,
                &self.dataset,
                format!("{} violation(s), batch not applied", violations.len()),
            )
            .with_details(json!({
                "task_id": self.task_id,
                "first_sequence_id": events.first().map(|e| e.sequence_id),
                "last_sequence_id": events.last().map(|e| e.sequence_id),
                "violations": violations,
            }));
            services.reporter.report(&anomaly).await?;
            return Err(OrchestratorError::ValidationRejected {
                dataset: self.dataset.clone(),
                violations,
            });
        }

        let staged = services.engine.prepare(mapping, events, ctx.as_of)?;
        ctx.guard.confirm()?;
        let outcome = services.engine.commit(staged)?;

        let anomalies: Vec<Anomaly> = outcome.anomalies().cloned().collect();
        services.reporter.report_all(&anomalies).await?;

        Ok(BatchOutput {
            events_applied: outcome.events_applied(),
            anomalies: anomalies.len(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Aggregate task
// ═══════════════════════════════════════════════════════════════════════════

/// Consumes the fact ledger up to the fact merge watermark and refreshes touched buckets
pub struct AggregateTask {
    task_id: TaskId,
    aggregate: String,
    fact_dataset: String,
}

impl AggregateTask {
    pub fn new(task_id: TaskId, aggregate: impl Into<String>, fact_dataset: impl Into<String>) -> Self {
        Self {
            task_id,
            aggregate: aggregate.into(),
            fact_dataset: fact_dataset.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for AggregateTask {
    fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    fn dataset(&self) -> &str {
        &self.fact_dataset
    }

    async fn read_bound(&self, services: &CoreServices) -> Result<u64> {
        Ok(services.engine.applied_through(&self.fact_dataset))
    }

    async fn process_batch(&self, events: &[ChangeEvent], ctx: &BatchContext<'_>) -> Result<BatchOutput> {
        let Some(last) = events.last() else {
            return Ok(BatchOutput::default());
        };

        ctx.guard.confirm()?;
        let report = ctx.services.aggregates.refresh_for_sequences(
            &self.aggregate,
            ctx.cursor,
            last.sequence_id,
            ctx.as_of,
        )?;

        debug!(
            task_id = %self.task_id,
            after = ctx.cursor,
            until = last.sequence_id,
            refreshed = report.buckets_refreshed,
            removed = report.buckets_removed,
            "Aggregate batch refreshed"
        );

        Ok(BatchOutput {
            events_applied: events.len(),
            anomalies: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, ScdflowConfig};
    use chrono::Utc;
    use scdflow_storage::{ChangeAction, LedgerStore, Row, SourceRow};

    const TTL: Duration = Duration::from_secs(30);

    fn services() -> CoreServices {
        CoreServices::in_memory(
            ScdflowConfig::new().with_dataset(
                DatasetConfig::dimension("customers", &["customer_id"]).required(&["name"]),
            ),
        )
        .unwrap()
    }

    fn guard() -> CommitGuard {
        let leases = Arc::new(LeaseTable::new());
        let lease = leases
            .try_acquire(&TaskId::merge_dimension("customers"), crate::job::Tick(1), "w", TTL)
            .unwrap();
        CommitGuard::new(leases, lease, TTL, CancellationToken::new())
    }

    async fn append(services: &CoreServices, rows: Vec<serde_json::Value>) -> Vec<ChangeEvent> {
        let rows = rows
            .into_iter()
            .map(|v| SourceRow::new(serde_json::from_value::<Row>(v).unwrap(), Utc::now()))
            .collect();
        services
            .ledger
            .append("customers", rows, ChangeAction::Insert)
            .await
            .unwrap()
            .appended
    }

    #[tokio::test]
    async fn test_merge_task_commits_batch() {
        let services = services();
        let events = append(&services, vec![json!({"customer_id": 1, "name": "Alice"})]).await;
        let guard = guard();
        let task = MergeTask::new(TaskId::merge_dimension("customers"), "customers");

        let ctx = BatchContext {
            services: &services,
            guard: &guard,
            cursor: 0,
            as_of: Utc::now(),
        };
        let output = task.process_batch(&events, &ctx).await.unwrap();
        assert_eq!(output.events_applied, 1);
        assert_eq!(task.committed_through(&services), Some(1));
        assert_eq!(task.read_bound(&services).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_merge_task_rejects_invalid_batch() {
        let services = services();
        let events = append(&services, vec![json!({"customer_id": 1})]).await;
        let guard = guard();
        let task = MergeTask::new(TaskId::merge_dimension("customers"), "customers");

        let ctx = BatchContext {
            services: &services,
            guard: &guard,
            cursor: 0,
            as_of: Utc::now(),
        };
        let err = task.process_batch(&events, &ctx).await.unwrap_err();
        assert_eq!(err.violations().len(), 1);
        assert_eq!(services.engine.applied_through("customers"), 0);

        let persisted = services.store.list_anomalies(Some("customers")).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].kind, AnomalyKind::ValidationRejected);
    }

    #[tokio::test]
    async fn test_cancelled_guard_blocks_commit() {
        let services = services();
        let events = append(&services, vec![json!({"customer_id": 1, "name": "A"})]).await;
        let leases = Arc::new(LeaseTable::new());
        let lease = leases
            .try_acquire(&TaskId::merge_dimension("customers"), crate::job::Tick(1), "w", TTL)
            .unwrap();
        let cancel = CancellationToken::new();
        let guard = CommitGuard::new(leases, lease, TTL, cancel.clone());
        cancel.cancel();

        let task = MergeTask::new(TaskId::merge_dimension("customers"), "customers");
        let ctx = BatchContext {
            services: &services,
            guard: &guard,
            cursor: 0,
            as_of: Utc::now(),
        };
        let err = task.process_batch(&events, &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert_eq!(services.engine.applied_through("customers"), 0);
    }

    #[test]
    fn test_guard_detects_lost_lease() {
        let guard = guard();
        assert!(guard.renew().is_ok());
        assert!(guard.release());
        assert!(matches!(
            guard.confirm().unwrap_err(),
            OrchestratorError::LeaseLost { .. }
        ));
    }
}
