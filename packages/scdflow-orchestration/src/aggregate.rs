//! Aggregate maintainer
//!
//! Rollup buckets keyed by (grouping key, period). A refresh recomputes only
//! the touched buckets from the live fact rows, so running it twice gives the
//! same table as running it once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use scdflow_storage::{AggregateRow, FactRow, Granularity, Period};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::catalog::{CatalogReader, DatasetState, SinkCatalog};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunc {
    Sum,
    Count,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunc::Sum => "sum",
            AggregateFunc::Count => "count",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dimension attribute to group by (the whole natural key if `attribute` is unset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupBy {
    pub dimension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureSpec {
    pub name: String,
    /// Fact measure to read; `count` may omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub func: AggregateFunc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateSpec {
    pub name: String,
    pub fact_dataset: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<GroupBy>,
    pub granularity: Granularity,
    pub measures: Vec<MeasureSpec>,
}

/// (grouping key, period)
pub type Bucket = (String, Period);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshReport {
    pub aggregate: String,
    pub buckets_refreshed: usize,
    /// Buckets left without contributing facts
    pub buckets_removed: usize,
}

pub struct AggregateMaintainer {
    catalog: Arc<SinkCatalog>,
    specs: HashMap<String, AggregateSpec>,
}

impl AggregateMaintainer {
    pub fn new(catalog: Arc<SinkCatalog>, specs: &[AggregateSpec]) -> Self {
        Self {
            catalog,
            specs: specs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
        }
    }

    pub fn spec(&self, aggregate: &str) -> Result<&AggregateSpec> {
        self.specs
            .get(aggregate)
            .ok_or_else(|| OrchestratorError::TaskNotFound(format!("aggregate '{}'", aggregate)))
    }

    /// Recompute the buckets of `affected_keys` in `period`
    pub fn refresh(
        &self,
        aggregate: &str,
        affected_keys: &[String],
        period: Period,
        as_of: DateTime<Utc>,
    ) -> Result<RefreshReport> {
        let buckets = affected_keys
            .iter()
            .map(|key| (key.clone(), period))
            .collect();
        self.refresh_buckets(aggregate, &buckets, as_of)
    }

    /// Buckets touched by a slice of fact rows
    pub fn affected_buckets(&self, aggregate: &str, facts: &[FactRow]) -> Result<BTreeSet<Bucket>> {
        let spec = self.spec(aggregate)?;
        let datasets = self.catalog.datasets();
        Ok(facts
            .iter()
            .map(|fact| bucket_of(spec, &datasets, fact))
            .collect())
    }

    /// Recompute buckets from the live facts; empty buckets are removed
    pub fn refresh_buckets(
        &self,
        aggregate: &str,
        buckets: &BTreeSet<Bucket>,
        as_of: DateTime<Utc>,
    ) -> Result<RefreshReport> {
        let spec = self.spec(aggregate)?;
        if buckets.is_empty() {
            return Ok(RefreshReport {
                aggregate: aggregate.to_string(),
                ..Default::default()
            });
        }

        let computed = {
            let guard = self.catalog.datasets();
            let datasets: &HashMap<String, DatasetState> = &guard;
            let live: Vec<&FactRow> = datasets
                .get(&spec.fact_dataset)
                .and_then(DatasetState::facts)
                .map(|t| t.live_rows().collect())
                .unwrap_or_default();

            let contributing: Vec<(Bucket, &FactRow)> = live
                .par_iter()
                .filter_map(|fact| {
                    let bucket = bucket_of(spec, datasets, fact);
                    buckets.contains(&bucket).then_some((bucket, *fact))
                })
                .collect();

            let mut grouped: BTreeMap<Bucket, Vec<&FactRow>> = BTreeMap::new();
            for (bucket, fact) in contributing {
                grouped.entry(bucket).or_default().push(fact);
            }

            grouped
                .into_par_iter()
                .map(|((grouping_key, period), facts)| {
                    let row = AggregateRow {
                        aggregate: spec.name.clone(),
                        measures: compute_measures(spec, &facts),
                        fact_count: facts.len(),
                        grouping_key: grouping_key.clone(),
                        period,
                        refreshed_at: as_of,
                    };
                    ((grouping_key, period), row)
                })
                .collect::<BTreeMap<_, _>>()
        };

        let mut report = RefreshReport {
            aggregate: aggregate.to_string(),
            ..Default::default()
        };
        let mut aggregates = self.catalog.aggregates_mut();
        let table = aggregates.entry(spec.name.clone()).or_default();
        for bucket in buckets {
            match computed.get(bucket) {
                Some(row) => {
                    table.insert(bucket.clone(), row.clone());
                    report.buckets_refreshed += 1;
                }
                None => {
                    if table.remove(bucket).is_some() {
                        report.buckets_removed += 1;
                    }
                }
            }
        }
        drop(aggregates);

        debug!(
            aggregate,
            refreshed = report.buckets_refreshed,
            removed = report.buckets_removed,
            "Aggregate buckets refreshed"
        );
        Ok(report)
    }

    /// Refresh every bucket touched by fact rows from ledger events in `(after, until]`
    pub fn refresh_for_sequences(
        &self,
        aggregate: &str,
        after: u64,
        until: u64,
        as_of: DateTime<Utc>,
    ) -> Result<RefreshReport> {
        let spec = self.spec(aggregate)?;
        let facts: Vec<FactRow> = self
            .catalog
            .datasets()
            .get(&spec.fact_dataset)
            .and_then(DatasetState::facts)
            .map(|t| t.rows_for_sequences(after, until).into_iter().cloned().collect())
            .unwrap_or_default();

        let buckets = self.affected_buckets(aggregate, &facts)?;
        self.refresh_buckets(aggregate, &buckets, as_of)
    }

    /// Recompute the whole aggregate from scratch
    pub fn rebuild(&self, aggregate: &str, as_of: DateTime<Utc>) -> Result<RefreshReport> {
        let spec = self.spec(aggregate)?;
        let live: Vec<FactRow> = self
            .catalog
            .datasets()
            .get(&spec.fact_dataset)
            .and_then(DatasetState::facts)
            .map(|t| t.live_rows().cloned().collect())
            .unwrap_or_default();

        // Stale buckets are refreshed too, which removes them
        let mut buckets = self.affected_buckets(aggregate, &live)?;
        buckets.extend(
            self.catalog
                .aggregates(&spec.name)
                .into_iter()
                .map(|row| (row.grouping_key, row.period)),
        );

        let report = self.refresh_buckets(aggregate, &buckets, as_of)?;
        info!(
            aggregate,
            buckets = report.buckets_refreshed,
            removed = report.buckets_removed,
            "Aggregate rebuilt"
        );
        Ok(report)
    }
}

/// Bucket a fact falls into, with dimension attributes taken from the version it references
fn bucket_of(spec: &AggregateSpec, datasets: &HashMap<String, DatasetState>, fact: &FactRow) -> Bucket {
    (grouping_key(spec, datasets, fact), Period::containing(spec.granularity, fact.event_time))
}

fn grouping_key(spec: &AggregateSpec, datasets: &HashMap<String, DatasetState>, fact: &FactRow) -> String {
    if spec.group_by.is_empty() {
        return "*".to_string();
    }

    spec.group_by
        .iter()
        .map(|group| {
            let version = fact
                .dimension_keys
                .get(&group.dimension)
                .and_then(|&sk| {
                    datasets
                        .get(&group.dimension)
                        .and_then(DatasetState::dimension)
                        .and_then(|t| t.by_surrogate(sk))
                });

            match &group.attribute {
                Some(attribute) => {
                    let value = version
                        .and_then(|v| v.attributes.get(attribute))
                        .map(render)
                        .unwrap_or_else(|| "null".to_string());
                    format!("{}.{}={}", group.dimension, attribute, value)
                }
                None => {
                    let key = version
                        .map(|v| v.natural_key.to_string())
                        .unwrap_or_else(|| "null".to_string());
                    format!("{}=[{}]", group.dimension, key)
                }
            }
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compute_measures(spec: &AggregateSpec, facts: &[&FactRow]) -> BTreeMap<String, f64> {
    spec.measures
        .iter()
        .map(|measure| {
            let values = facts.iter().filter_map(|fact| match &measure.source {
                Some(source) => fact.measures.get(source).copied(),
                None => Some(1.0),
            });
            let value = match measure.func {
                AggregateFunc::Sum => values.sum(),
                AggregateFunc::Count => values.count() as f64,
                AggregateFunc::Min => values.fold(f64::INFINITY, f64::min),
                AggregateFunc::Max => values.fold(f64::NEG_INFINITY, f64::max),
            };
            (measure.name.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, ScdflowConfig};
    use crate::merge::{DatasetMapping, MergeEngine};
    use chrono::TimeZone;
    use scdflow_storage::{ChangeAction, ChangeEvent, NaturalKey};
    use serde_json::json;

    fn t(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn spec() -> AggregateSpec {
        AggregateSpec {
            name: "revenue_by_region".to_string(),
            fact_dataset: "orders".to_string(),
            group_by: vec![GroupBy {
                dimension: "customers".to_string(),
                attribute: Some("region".to_string()),
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
                MeasureSpec {
                    name: "largest".to_string(),
                    source: Some("amount".to_string()),
                    func: AggregateFunc::Max,
                },
            ],
        }
    }

    struct Fixture {
        engine: MergeEngine,
        maintainer: AggregateMaintainer,
        mappings: HashMap<String, DatasetMapping>,
        next_seq: HashMap<&'static str, u64>,
    }

    impl Fixture {
        fn new() -> Self {
            let config = ScdflowConfig::new()
                .with_dataset(DatasetConfig::dimension("customers", &["customer_id"]))
                .with_dataset(
                    DatasetConfig::fact("orders", &["order_id"])
                        .measures(&["amount"])
                        .reference("customers", &["customer_id"]),
                )
                .with_aggregate(spec());
            let catalog = Arc::new(SinkCatalog::new("test"));
            Self {
                engine: MergeEngine::new(catalog.clone(), 2),
                maintainer: AggregateMaintainer::new(catalog, &config.aggregates),
                mappings: DatasetMapping::all(&config).unwrap(),
                next_seq: HashMap::new(),
            }
        }

        fn apply(
            &mut self,
            dataset: &'static str,
            key: &str,
            id: u64,
            action: ChangeAction,
            payload: Value,
            at: DateTime<Utc>,
        ) -> Vec<FactRow> {
            let seq = {
                let next = self.next_seq.entry(dataset).or_insert(0);
                *next += 1;
                *next
            };
            let event = ChangeEvent {
                sequence_id: seq,
                dataset: dataset.to_string(),
                key: NaturalKey::single(key, id.to_string()),
                action,
                payload: serde_json::from_value(payload).unwrap(),
                captured_at: at,
            };
            self.engine
                .apply_batch(&self.mappings[dataset], &[event], at)
                .unwrap()
                .appended_facts
        }

        fn refresh(&self, facts: &[FactRow]) -> RefreshReport {
            let buckets = self.maintainer.affected_buckets("revenue_by_region", facts).unwrap();
            self.maintainer
                .refresh_buckets("revenue_by_region", &buckets, Utc::now())
                .unwrap()
        }

        fn row(&self, key: &str, day: u32) -> Option<AggregateRow> {
            self.engine.catalog().aggregate_row(
                "revenue_by_region",
                key,
                Period::containing(Granularity::Day, t(day, 0)),
            )
        }
    }

    #[test]
    fn test_refresh_touched_buckets() {
        let mut fx = Fixture::new();
        fx.apply("customers", "customer_id", 1, ChangeAction::Insert, json!({"customer_id": 1, "region": "EU"}), t(1, 0));
        fx.apply("customers", "customer_id", 2, ChangeAction::Insert, json!({"customer_id": 2, "region": "US"}), t(1, 0));

        let mut facts = fx.apply("orders", "order_id", 10, ChangeAction::Insert, json!({"order_id": 10, "customer_id": 1, "amount": 5}), t(2, 3));
        facts.extend(fx.apply("orders", "order_id", 11, ChangeAction::Insert, json!({"order_id": 11, "customer_id": 1, "amount": 7}), t(2, 9)));
        facts.extend(fx.apply("orders", "order_id", 12, ChangeAction::Insert, json!({"order_id": 12, "customer_id": 2, "amount": 1}), t(3, 1)));

        let report = fx.refresh(&facts);
        assert_eq!(report.buckets_refreshed, 2);

        let eu = fx.row("customers.region=EU", 2).unwrap();
        assert_eq!(eu.measures["revenue"], 12.0);
        assert_eq!(eu.measures["orders"], 2.0);
        assert_eq!(eu.measures["largest"], 7.0);
        assert_eq!(eu.fact_count, 2);

        // Idempotent
        assert_eq!(fx.refresh(&facts), report);
        assert_eq!(fx.row("customers.region=EU", 2).unwrap().measures, eu.measures);
    }

    #[test]
    fn test_correction_moves_between_buckets() {
        let mut fx = Fixture::new();
        fx.apply("customers", "customer_id", 1, ChangeAction::Insert, json!({"customer_id": 1, "region": "EU"}), t(1, 0));
        fx.apply("customers", "customer_id", 2, ChangeAction::Insert, json!({"customer_id": 2, "region": "US"}), t(1, 0));

        let facts = fx.apply("orders", "order_id", 10, ChangeAction::Insert, json!({"order_id": 10, "customer_id": 1, "amount": 5}), t(2, 3));
        fx.refresh(&facts);
        assert!(fx.row("customers.region=EU", 2).is_some());

        // Re-point the order to a US customer
        let corrected = fx.apply("orders", "order_id", 10, ChangeAction::Update, json!({"customer_id": 2}), t(2, 3));
        assert_eq!(corrected.len(), 2);
        let report = fx.refresh(&corrected);
        assert_eq!(report.buckets_refreshed, 1);
        assert_eq!(report.buckets_removed, 1);

        assert!(fx.row("customers.region=EU", 2).is_none());
        assert_eq!(fx.row("customers.region=US", 2).unwrap().measures["revenue"], 5.0);
    }

    #[test]
    fn test_refresh_for_sequences_matches_rebuild() {
        let mut fx = Fixture::new();
        fx.apply("customers", "customer_id", 1, ChangeAction::Insert, json!({"customer_id": 1, "region": "EU"}), t(1, 0));
        for id in 0..5 {
            fx.apply("orders", "order_id", id, ChangeAction::Insert, json!({"order_id": id, "customer_id": 1, "amount": id}), t(2 + id as u32 % 2, 0));
        }
        fx.apply("orders", "order_id", 3, ChangeAction::Delete, json!({"order_id": 3}), t(9, 0));

        fx.maintainer
            .refresh_for_sequences("revenue_by_region", 0, 6, Utc::now())
            .unwrap();
        let incremental = vec![fx.row("customers.region=EU", 2), fx.row("customers.region=EU", 3)];

        fx.maintainer.rebuild("revenue_by_region", Utc::now()).unwrap();
        let rebuilt = vec![fx.row("customers.region=EU", 2), fx.row("customers.region=EU", 3)];

        for (a, b) in incremental.iter().zip(&rebuilt) {
            assert_eq!(a.as_ref().map(|r| &r.measures), b.as_ref().map(|r| &r.measures));
        }
        // 1 + 3 deleted
        assert_eq!(rebuilt[1].as_ref().unwrap().measures["revenue"], 1.0);
    }

    #[test]
    fn test_refresh_by_keys_and_period() {
        let mut fx = Fixture::new();
        fx.apply("customers", "customer_id", 1, ChangeAction::Insert, json!({"customer_id": 1, "region": "EU"}), t(1, 0));
        fx.apply("orders", "order_id", 10, ChangeAction::Insert, json!({"order_id": 10, "customer_id": 1, "amount": 4}), t(2, 5));

        let report = fx
            .maintainer
            .refresh(
                "revenue_by_region",
                &["customers.region=EU".to_string(), "customers.region=XX".to_string()],
                Period::containing(Granularity::Day, t(2, 0)),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(report.buckets_refreshed, 1);
        assert_eq!(report.buckets_removed, 0);
        assert_eq!(fx.row("customers.region=EU", 2).unwrap().measures["revenue"], 4.0);
    }

    #[test]
    fn test_unknown_aggregate() {
        let fx = Fixture::new();
        assert!(fx.maintainer.rebuild("nope", Utc::now()).is_err());
    }
}
