//! End-to-end scenarios through the orchestrator
//!
//! - A: insert then update keeps history
//! - B: orphan update is surfaced, never merged
//! - C: delete, then point-in-time fact resolution
//! - D: validation rejection leaves everything untouched
//! - E: racing workers on one cursor

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use scdflow_orchestration::{
    CatalogReader, CoreServices, DatasetConfig, MemoryAnomalySink, OrchestratorError,
    ScdflowConfig, SinkCatalog, TaskId, TaskOrchestrator, TaskState, TaskStatus, Tick,
    TriggerOutcome, ValidationRule,
};
use scdflow_storage::{
    AnomalyKind, ChangeAction, InMemoryLedgerStore, LedgerStore, NaturalKey, Row, SourceRow,
};
use serde_json::{json, Value};

fn t(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
}

fn customer(id: u64) -> NaturalKey {
    NaturalKey::single("customer_id", id.to_string())
}

fn config() -> ScdflowConfig {
    let mut config = ScdflowConfig::new()
        .with_dataset(
            DatasetConfig::dimension("customers", &["customer_id"])
                .required(&["name"])
                .rule(ValidationRule::UniqueInsertKeys),
        )
        .with_dataset(
            DatasetConfig::fact("orders", &["order_id"])
                .measures(&["amount"])
                .reference("customers", &["customer_id"])
                .rule(ValidationRule::ForeignKey {
                    dimension: "customers".to_string(),
                    columns: vec!["customer_id".to_string()],
                }),
        );
    config.orchestrator.retry_backoff_ms = 1;
    config
}

struct Harness {
    orchestrator: TaskOrchestrator,
    store: Arc<InMemoryLedgerStore>,
    alerts: Arc<MemoryAnomalySink>,
}

impl Harness {
    fn new(config: ScdflowConfig) -> Self {
        let store = Arc::new(InMemoryLedgerStore::new());
        let alerts = Arc::new(MemoryAnomalySink::new());
        let services = CoreServices::new(
            config,
            store.clone(),
            Arc::new(SinkCatalog::new("live")),
            alerts.clone(),
        )
        .unwrap();
        Self {
            orchestrator: TaskOrchestrator::new(services).unwrap(),
            store,
            alerts,
        }
    }

    fn catalog(&self) -> &SinkCatalog {
        &self.orchestrator.services().catalog
    }

    async fn append(&self, dataset: &str, action: ChangeAction, rows: Vec<(Value, DateTime<Utc>)>) {
        let rows = rows
            .into_iter()
            .map(|(v, at)| SourceRow::new(serde_json::from_value::<Row>(v).unwrap(), at))
            .collect();
        self.orchestrator
            .services()
            .ledger
            .append(dataset, rows, action)
            .await
            .unwrap();
    }

    async fn cursor(&self, task: &TaskId, dataset: &str) -> u64 {
        self.store
            .load_cursor(task.as_str(), dataset)
            .await
            .unwrap()
            .last_sequence_id
    }
}

#[tokio::test]
async fn test_scenario_a_insert_then_update_keeps_history() {
    let h = Harness::new(config());

    h.append("customers", ChangeAction::Insert, vec![(json!({"customer_id": 1, "name": "Alice"}), t(1))])
        .await;
    assert!(h.orchestrator.run_tick(Tick(1)).await.unwrap().all_succeeded());

    h.append("customers", ChangeAction::Update, vec![(json!({"customer_id": 1, "name": "Alicia"}), t(5))])
        .await;
    assert!(h.orchestrator.run_tick(Tick(2)).await.unwrap().all_succeeded());

    let history = h.catalog().entity_history("customers", &customer(1));
    assert_eq!(history.len(), 2);

    assert!(!history[0].is_current);
    assert_eq!(history[0].attributes["name"], json!("Alice"));
    assert_eq!(history[0].valid_from, t(1));
    assert_eq!(history[0].valid_to, Some(t(5)));

    assert!(history[1].is_current);
    assert_eq!(history[1].attributes["name"], json!("Alicia"));
    assert_eq!(history[1].valid_from, t(5));
    assert_eq!(history[1].valid_to, None);
    assert_ne!(history[0].surrogate_key, history[1].surrogate_key);

    let task = TaskId::merge_dimension("customers");
    assert_eq!(h.cursor(&task, "customers").await, 2);
}

#[tokio::test]
async fn test_scenario_b_orphan_update_is_surfaced() {
    let h = Harness::new(config());

    h.append("customers", ChangeAction::Update, vec![(json!({"customer_id": 2, "name": "Bob"}), t(1))])
        .await;

    // Batch 1 buffers; each later tick ages the orphan by one empty batch
    for tick in 1..=3 {
        h.orchestrator.run_tick(Tick(tick)).await.unwrap();
    }

    assert!(h.catalog().current_entities("customers").is_empty());
    assert!(h.catalog().entity_history("customers", &customer(2)).is_empty());
    assert!(h.catalog().pending_orphans("customers").is_empty());

    let orphans = h.alerts.of_kind(AnomalyKind::OrphanEvent);
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].sequence_id, Some(1));
    assert_eq!(orphans[0].natural_key, Some(customer(2)));

    let persisted = h.store.list_anomalies(Some("customers")).await.unwrap();
    assert!(persisted.iter().any(|a| a.kind == AnomalyKind::OrphanEvent));
    assert_eq!(h.catalog().quarantined("customers").len(), 1);
}

#[tokio::test]
async fn test_scenario_c_delete_then_point_in_time_fact() {
    let h = Harness::new(config());

    h.append("customers", ChangeAction::Insert, vec![(json!({"customer_id": 1, "name": "Alice"}), t(1))])
        .await;
    h.append("customers", ChangeAction::Update, vec![(json!({"customer_id": 1, "name": "Alicia"}), t(5))])
        .await;
    h.append("customers", ChangeAction::Delete, vec![(json!({"customer_id": 1}), t(10))])
        .await;
    assert!(h.orchestrator.run_tick(Tick(1)).await.unwrap().all_succeeded());

    assert!(h.catalog().current_entities("customers").is_empty());
    let history = h.catalog().entity_history("customers", &customer(1));
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].valid_to, Some(t(10)));

    // Fact time after the delete resolves to the last version effective before it
    h.append(
        "orders",
        ChangeAction::Insert,
        vec![
            (json!({"order_id": 100, "customer_id": 1, "amount": 20.0}), t(3)),
            (json!({"order_id": 101, "customer_id": 1, "amount": 35.0}), t(12)),
        ],
    )
    .await;
    assert!(h.orchestrator.run_tick(Tick(2)).await.unwrap().all_succeeded());

    let facts = h.catalog().facts("orders");
    assert_eq!(facts.len(), 2);
    let by_order = |id: &str| {
        facts
            .iter()
            .find(|f| f.natural_key.get("order_id") == Some(id))
            .unwrap()
    };
    assert_eq!(by_order("100").dimension_keys["customers"], history[0].surrogate_key);
    assert_eq!(by_order("101").dimension_keys["customers"], history[1].surrogate_key);
}

#[tokio::test]
async fn test_scenario_d_rejected_batch_changes_nothing() {
    let h = Harness::new(config());
    let task = TaskId::merge_dimension("customers");

    h.append(
        "customers",
        ChangeAction::Insert,
        vec![
            (json!({"customer_id": 1, "name": "Alice"}), t(1)),
            (json!({"customer_id": 1, "name": "Alice again"}), t(2)),
        ],
    )
    .await;

    let outcome = h.orchestrator.trigger(&task, Tick(1)).await.unwrap();
    let TriggerOutcome::Failed(run) = outcome else {
        panic!("expected a failed run, got {:?}", outcome);
    };
    assert_eq!(run.status, TaskStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some("validation_rejected"));
    assert_eq!(run.violations.len(), 1);
    assert_eq!(run.violations[0].rule, "unique_insert_keys");

    // Permanent: no automatic retry
    assert!(matches!(
        h.orchestrator.state(&task, Tick(1)),
        TaskState::Failed { next_retry_at: None, attempt: 1, .. }
    ));
    assert_eq!(h.orchestrator.runs().runs(&task, Tick(1)).len(), 1);

    assert_eq!(h.cursor(&task, "customers").await, 0);
    assert!(h.catalog().all_versions("customers").is_empty());
    assert_eq!(h.catalog().applied_through("customers"), 0);
    assert_eq!(h.alerts.of_kind(AnomalyKind::ValidationRejected).len(), 1);

    // Downstream never dispatches for this tick
    let facts = TaskId::merge_facts("orders");
    let outcome = h.orchestrator.trigger(&facts, Tick(1)).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Skipped(_)));
}

#[tokio::test]
async fn test_scenario_d_fact_batch_with_unknown_customer_is_rejected() {
    let h = Harness::new(config());
    h.append("customers", ChangeAction::Insert, vec![(json!({"customer_id": 1, "name": "Alice"}), t(1))])
        .await;
    h.append(
        "orders",
        ChangeAction::Insert,
        vec![
            (json!({"order_id": 1, "customer_id": 1, "amount": 5.0}), t(2)),
            (json!({"order_id": 2, "customer_id": 99, "amount": 7.0}), t(2)),
        ],
    )
    .await;

    let report = h.orchestrator.run_tick(Tick(1)).await.unwrap();
    let facts_task = TaskId::merge_facts("orders");
    assert_eq!(report.task(&facts_task).unwrap().state, "failed");

    // Whole batch held back, including the valid row
    assert!(h.catalog().facts("orders").is_empty());
    assert_eq!(h.cursor(&facts_task, "orders").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_e_racing_workers_apply_each_event_once() {
    let mut config = config();
    config.engine.batch_size = 7;
    config.orchestrator.conflict_retries = 10;
    let h = Harness::new(config);

    let rows = (1..=60)
        .map(|id| (json!({"customer_id": id, "name": format!("c{}", id)}), t(1)))
        .collect();
    h.append("customers", ChangeAction::Insert, rows).await;

    let task = TaskId::merge_dimension("customers");
    let worker_a = h.orchestrator.with_worker_id("worker-a");
    let worker_b = h.orchestrator.with_worker_id("worker-b");

    // Different ticks, so both hold a lease and contend only on the cursor
    let (a, b) = tokio::join!(
        worker_a.trigger(&task, Tick(1)),
        worker_b.trigger(&task, Tick(2)),
    );
    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());

    assert_eq!(h.cursor(&task, "customers").await, 60);
    assert_eq!(h.catalog().applied_through("customers"), 60);

    let versions = h.catalog().all_versions("customers");
    assert_eq!(versions.len(), 60);
    assert!(versions.iter().all(|v| v.is_current));
}

#[tokio::test]
async fn test_scenario_e_exactly_one_cas_wins() {
    let h = Harness::new(config());
    h.append("customers", ChangeAction::Insert, vec![(json!({"customer_id": 1, "name": "A"}), t(1))])
        .await;

    let cursors = &h.orchestrator.services().cursors;
    let seen_by_a = cursors.load("consumer", "customers").await.unwrap();
    let seen_by_b = seen_by_a.clone();

    let first = cursors.advance(&seen_by_a, 1).await;
    let second = cursors.advance(&seen_by_b, 1).await;
    assert!(first.is_ok());
    assert!(matches!(second, Err(OrchestratorError::MergeConflict { .. })));

    // The loser retries against the new value
    let reloaded = cursors.load("consumer", "customers").await.unwrap();
    assert_eq!(reloaded.last_sequence_id, 1);
}

#[tokio::test]
async fn test_rerun_of_succeeded_tick_is_noop() {
    let h = Harness::new(config());
    h.append("customers", ChangeAction::Insert, vec![(json!({"customer_id": 1, "name": "A"}), t(1))])
        .await;

    h.orchestrator.run_tick(Tick(1)).await.unwrap();
    let before = h.orchestrator.runs().all_runs().len();
    let report = h.orchestrator.run_tick(Tick(1)).await.unwrap();

    assert!(report.tasks.iter().all(|t| t.outcome == "already_succeeded"));
    assert_eq!(h.orchestrator.runs().all_runs().len(), before);
}
