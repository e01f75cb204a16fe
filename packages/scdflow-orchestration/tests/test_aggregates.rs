//! Incremental aggregate refresh against a full rebuild

use chrono::{DateTime, TimeZone, Utc};
use scdflow_orchestration::{
    AggregateFunc, AggregateSpec, CatalogReader, CoreServices, DatasetConfig, GroupBy,
    MeasureSpec, ScdflowConfig, TaskOrchestrator, Tick,
};
use scdflow_storage::{AggregateRow, ChangeAction, Granularity, Period, Row, SourceRow};
use serde_json::{json, Value};

const AGGREGATE: &str = "revenue_by_tier";

fn t(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).unwrap()
}

fn config() -> ScdflowConfig {
    ScdflowConfig::new()
        .with_dataset(DatasetConfig::dimension("customers", &["customer_id"]))
        .with_dataset(
            DatasetConfig::fact("orders", &["order_id"])
                .measures(&["amount"])
                .reference("customers", &["customer_id"]),
        )
        .with_aggregate(AggregateSpec {
            name: AGGREGATE.to_string(),
            fact_dataset: "orders".to_string(),
            group_by: vec![GroupBy {
                dimension: "customers".to_string(),
                attribute: Some("tier".to_string()),
            }],
            granularity: Granularity::Day,
            measures: vec![
                MeasureSpec {
                    name: "revenue".to_string(),
                    source: Some("amount".to_string()),
                    func: AggregateFunc::Sum,
                },
                MeasureSpec {
                    name: "orders".to_string(),
                    source: None,
                    func: AggregateFunc::Count,
                },
            ],
        })
}

async fn append(orchestrator: &TaskOrchestrator, dataset: &str, action: ChangeAction, row: Value, at: DateTime<Utc>) {
    let rows = vec![SourceRow::new(serde_json::from_value::<Row>(row).unwrap(), at)];
    orchestrator
        .services()
        .ledger
        .append(dataset, rows, action)
        .await
        .unwrap();
}

/// Bucket contents without refresh timestamps, in a stable order
fn buckets(orchestrator: &TaskOrchestrator) -> Vec<(String, Period, Vec<(String, f64)>, usize)> {
    let mut rows: Vec<_> = orchestrator
        .services()
        .catalog
        .aggregates(AGGREGATE)
        .into_iter()
        .map(|row: AggregateRow| {
            let measures = row.measures.into_iter().collect();
            (row.grouping_key, row.period, measures, row.fact_count)
        })
        .collect();
    rows.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    rows
}

async fn assert_matches_rebuild(orchestrator: &TaskOrchestrator) {
    let incremental = buckets(orchestrator);
    orchestrator
        .services()
        .aggregates
        .rebuild(AGGREGATE, Utc::now())
        .unwrap();
    assert_eq!(incremental, buckets(orchestrator));
}

#[tokio::test]
async fn test_replayed_fact_update_reaches_the_aggregate() {
    let orchestrator = TaskOrchestrator::new(CoreServices::in_memory(config()).unwrap()).unwrap();
    append(&orchestrator, "customers", ChangeAction::Insert, json!({"customer_id": 1, "tier": "gold"}), t(1)).await;
    // Correction arrives before the order it corrects
    append(&orchestrator, "orders", ChangeAction::Update, json!({"order_id": 10, "amount": 9}), t(3)).await;
    assert!(orchestrator.run_tick(Tick(1)).await.unwrap().all_succeeded());
    assert_eq!(orchestrator.services().catalog.pending_orphans("orders").len(), 1);
    assert!(buckets(&orchestrator).is_empty());

    append(
        &orchestrator,
        "orders",
        ChangeAction::Insert,
        json!({"order_id": 10, "customer_id": 1, "amount": 5}),
        t(2),
    )
    .await;
    assert!(orchestrator.run_tick(Tick(2)).await.unwrap().all_succeeded());

    let catalog = &orchestrator.services().catalog;
    let day3 = Period::containing(Granularity::Day, t(3));
    let gold = catalog.aggregate_row(AGGREGATE, "customers.tier=gold", day3).unwrap();
    assert_eq!(gold.measures["revenue"], 9.0);
    assert_eq!(gold.measures["orders"], 1.0);
    // The superseded insert nets out of its own day
    let day2 = Period::containing(Granularity::Day, t(2));
    assert!(catalog.aggregate_row(AGGREGATE, "customers.tier=gold", day2).is_none());

    assert_matches_rebuild(&orchestrator).await;
}

#[tokio::test]
async fn test_replayed_fact_delete_leaves_no_bucket() {
    let orchestrator = TaskOrchestrator::new(CoreServices::in_memory(config()).unwrap()).unwrap();
    append(&orchestrator, "customers", ChangeAction::Insert, json!({"customer_id": 1, "tier": "silver"}), t(1)).await;
    append(&orchestrator, "orders", ChangeAction::Insert, json!({"order_id": 1, "customer_id": 1, "amount": 4}), t(2)).await;
    append(&orchestrator, "orders", ChangeAction::Delete, json!({"order_id": 7}), t(3)).await;
    assert!(orchestrator.run_tick(Tick(1)).await.unwrap().all_succeeded());

    append(&orchestrator, "orders", ChangeAction::Insert, json!({"order_id": 7, "customer_id": 1, "amount": 6}), t(4)).await;
    assert!(orchestrator.run_tick(Tick(2)).await.unwrap().all_succeeded());

    let catalog = &orchestrator.services().catalog;
    let day2 = Period::containing(Granularity::Day, t(2));
    let silver = catalog.aggregate_row(AGGREGATE, "customers.tier=silver", day2).unwrap();
    assert_eq!(silver.measures["revenue"], 4.0);
    assert_eq!(silver.measures["orders"], 1.0);
    let day4 = Period::containing(Granularity::Day, t(4));
    assert!(catalog.aggregate_row(AGGREGATE, "customers.tier=silver", day4).is_none());

    assert_matches_rebuild(&orchestrator).await;
}
