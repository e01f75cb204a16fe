//! SCD2 merge engine
//!
//! Applies a batch of ledger events to one dataset of the sink catalog.
//!
//! ## Rules
//!
//! - Events are grouped by natural key; within a key they apply in sequence order.
//! - Dimensions: INSERT opens a version, UPDATE (a patch) closes the current
//!   version and opens a new one unless the merged attributes are unchanged,
//!   DELETE closes the current version.
//! - Facts: INSERT appends, UPDATE compensates the live row and appends the
//!   corrected one, DELETE only compensates. References resolve to the
//!   dimension version effective at the event time.
//! - UPDATE/DELETE without a predecessor waits in the orphan buffer and is
//!   surfaced as an `OrphanEvent` anomaly once it outlives the retry limit.
//! - Events at or below the dataset's `applied_through` watermark are duplicates.
//!
//! [`MergeEngine::prepare`] computes the batch on a private copy of the
//! dataset state; [`MergeEngine::commit`] swaps it in only if nobody else
//! committed in between.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scdflow_storage::{Anomaly, AnomalyKind, ChangeAction, ChangeEvent, FactRow, NaturalKey};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::catalog::{
    CatalogReader, DatasetState, DimensionTable, FactTable, PendingBuffer, PendingEvent,
    SinkCatalog, TableData,
};
use crate::config::{DatasetKind, ScdflowConfig};
use crate::error::{OrchestratorError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// Mapping
// ═══════════════════════════════════════════════════════════════════════════

/// Fact reference with the referenced dimension's key columns filled in
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReference {
    pub dimension: String,
    /// Columns of the fact row
    pub source_columns: Vec<String>,
    /// Key columns of the dimension, same order
    pub target_columns: Vec<String>,
}

/// How ledger events of one dataset map onto its catalog table
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetMapping {
    pub dataset: String,
    pub kind: DatasetKind,
    pub key_columns: Vec<String>,
    pub references: Vec<ResolvedReference>,
    pub measures: Vec<String>,
}

impl DatasetMapping {
    pub fn from_config(config: &ScdflowConfig, dataset: &str) -> Result<Self> {
        let declared = config
            .dataset(dataset)
            .ok_or_else(|| OrchestratorError::UnknownDataset(dataset.to_string()))?;

        let references = declared
            .references
            .iter()
            .map(|reference| {
                let target = config
                    .dataset(&reference.dimension)
                    .ok_or_else(|| OrchestratorError::UnknownDataset(reference.dimension.clone()))?;
                Ok(ResolvedReference {
                    dimension: reference.dimension.clone(),
                    source_columns: reference.columns.clone(),
                    target_columns: target.key_columns.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dataset: declared.name.clone(),
            kind: declared.kind,
            key_columns: declared.key_columns.clone(),
            references,
            measures: declared.measures.clone(),
        })
    }

    /// Mappings for every declared dataset
    pub fn all(config: &ScdflowConfig) -> Result<HashMap<String, DatasetMapping>> {
        config
            .datasets
            .iter()
            .map(|d| Ok((d.name.clone(), Self::from_config(config, &d.name)?)))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outcome
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub dataset: String,
    pub events_seen: usize,
    pub versions_created: usize,
    pub versions_closed: usize,
    pub no_ops: usize,
    /// Events at or below the watermark
    pub duplicates: usize,
    /// Events parked in the orphan buffer
    pub buffered: usize,
    /// Buffered events applied once their predecessor arrived
    pub replayed: usize,
    pub facts_appended: usize,
    pub compensations: usize,
    pub orphans: Vec<Anomaly>,
    pub row_anomalies: Vec<Anomaly>,
    pub applied_through: u64,
    /// Fact rows written by this batch, compensations included
    #[serde(skip)]
    pub appended_facts: Vec<FactRow>,
}

impl MergeOutcome {
    pub fn events_applied(&self) -> usize {
        self.events_seen - self.duplicates
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &Anomaly> {
        self.row_anomalies.iter().chain(&self.orphans)
    }
}

/// Computed but uncommitted batch
#[derive(Debug)]
pub struct StagedMerge {
    dataset: String,
    base_watermark: u64,
    /// Commit generation the batch was computed against
    base_generation: u64,
    state: DatasetState,
    outcome: MergeOutcome,
}

impl StagedMerge {
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn base_watermark(&self) -> u64 {
        self.base_watermark
    }

    pub fn outcome(&self) -> &MergeOutcome {
        &self.outcome
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

pub struct MergeEngine {
    catalog: Arc<SinkCatalog>,
    orphan_retry_limit: u32,
}

impl MergeEngine {
    pub fn new(catalog: Arc<SinkCatalog>, orphan_retry_limit: u32) -> Self {
        Self {
            catalog,
            orphan_retry_limit,
        }
    }

    pub fn catalog(&self) -> &Arc<SinkCatalog> {
        &self.catalog
    }

    pub fn applied_through(&self, dataset: &str) -> u64 {
        self.catalog.applied_through(dataset)
    }

    /// Prepare and commit in one step
    pub fn apply_batch(
        &self,
        mapping: &DatasetMapping,
        events: &[ChangeEvent],
        as_of: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let staged = self.prepare(mapping, events, as_of)?;
        self.commit(staged)
    }

    /// Compute the batch against a private copy of the dataset state
    pub fn prepare(
        &self,
        mapping: &DatasetMapping,
        events: &[ChangeEvent],
        as_of: DateTime<Utc>,
    ) -> Result<StagedMerge> {
        let datasets = self.catalog.datasets();
        let mut state = match datasets.get(&mapping.dataset) {
            Some(existing) if existing.kind() != mapping.kind => {
                return Err(OrchestratorError::SchemaMismatch {
                    dataset: mapping.dataset.clone(),
                    reason: format!(
                        "catalog holds a {} table, mapping declares {}",
                        existing.kind().as_str(),
                        mapping.kind.as_str()
                    ),
                })
            }
            Some(existing) => existing.clone(),
            None => DatasetState::new(mapping.kind),
        };

        let base_watermark = state.applied_through;
        let base_generation = state.generation;
        let mut outcome = MergeOutcome {
            dataset: mapping.dataset.clone(),
            events_seen: events.len(),
            ..Default::default()
        };

        let mut by_key: BTreeMap<&NaturalKey, Vec<&ChangeEvent>> = BTreeMap::new();
        for event in events {
            if event.dataset != mapping.dataset {
                return Err(OrchestratorError::SchemaMismatch {
                    dataset: mapping.dataset.clone(),
                    reason: format!(
                        "event {} belongs to dataset '{}'",
                        event.sequence_id, event.dataset
                    ),
                });
            }
            if event.sequence_id <= base_watermark {
                outcome.duplicates += 1;
                continue;
            }
            by_key.entry(&event.key).or_default().push(event);
        }

        let mut high_water = base_watermark;
        {
            let DatasetState {
                table,
                pending,
                quarantine,
                ..
            } = &mut state;

            let mut batch = BatchApply {
                mapping,
                as_of,
                catalog: &*datasets,
                pending,
                outcome: &mut outcome,
            };

            for (_, mut key_events) in by_key {
                key_events.sort_by_key(|e| e.sequence_id);
                for event in key_events {
                    high_water = high_water.max(event.sequence_id);
                    match &mut *table {
                        TableData::Dimension(t) => batch.apply_dimension(t, event.clone(), 0),
                        TableData::Fact(t) => {
                            batch.apply_fact(t, event.clone(), 0, event.sequence_id)
                        }
                    }
                }
            }

            // One retry per batch for everything still waiting
            for expired in batch.pending.age(self.orphan_retry_limit) {
                let anomaly = Anomaly::new(
                    AnomalyKind::OrphanEvent,
                    &mapping.dataset,
                    format!(
                        "{} for {} found no predecessor after {} batch(es)",
                        expired.event.action, expired.event.key, expired.retries
                    ),
                )
                .with_event(&expired.event);
                batch.outcome.orphans.push(anomaly);
            }

            quarantine.extend(outcome.anomalies().cloned());
        }

        state.applied_through = high_water;
        state.generation = base_generation + 1;
        outcome.applied_through = high_water;

        debug!(
            dataset = %mapping.dataset,
            base_watermark,
            applied_through = high_water,
            created = outcome.versions_created,
            closed = outcome.versions_closed,
            facts = outcome.facts_appended,
            buffered = outcome.buffered,
            "Merge prepared"
        );

        Ok(StagedMerge {
            dataset: mapping.dataset.clone(),
            base_watermark,
            base_generation,
            state,
            outcome,
        })
    }

    /// Swap the staged state in if no other commit landed since `prepare`
    pub fn commit(&self, staged: StagedMerge) -> Result<MergeOutcome> {
        let mut datasets = self.catalog.datasets_mut();
        let current = datasets.get(&staged.dataset).map_or(0, |s| s.generation);

        if current != staged.base_generation {
            return Err(OrchestratorError::MergeConflict {
                dataset: staged.dataset,
                reason: format!(
                    "dataset moved from commit {} to {} since prepare",
                    staged.base_generation, current
                ),
            });
        }

        datasets.insert(staged.dataset.clone(), staged.state);
        drop(datasets);

        let outcome = staged.outcome;
        info!(
            dataset = %outcome.dataset,
            applied_through = outcome.applied_through,
            events = outcome.events_applied(),
            created = outcome.versions_created,
            closed = outcome.versions_closed,
            no_ops = outcome.no_ops,
            duplicates = outcome.duplicates,
            facts = outcome.facts_appended,
            compensations = outcome.compensations,
            orphans = outcome.orphans.len(),
            anomalies = outcome.row_anomalies.len(),
            "Merge committed"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_batch(&outcome.dataset, outcome.events_applied());

        Ok(outcome)
    }
}

/// Per-batch working set
struct BatchApply<'a> {
    mapping: &'a DatasetMapping,
    as_of: DateTime<Utc>,
    /// Committed catalog, for reference resolution
    catalog: &'a HashMap<String, DatasetState>,
    pending: &'a mut PendingBuffer,
    outcome: &'a mut MergeOutcome,
}

impl BatchApply<'_> {
    fn apply_dimension(&mut self, table: &mut DimensionTable, event: ChangeEvent, retries: u32) {
        let key = event.key.clone();
        let current = table
            .current(&key)
            .map(|v| (v.attributes.clone(), v.valid_from));

        match (event.action, current) {
            (ChangeAction::Insert, None) => {
                // Re-insert after a delete starts where the last version ended
                let valid_from = match table.last_version(&key) {
                    Some(last) => event
                        .captured_at
                        .max(last.valid_to.unwrap_or(last.valid_from)),
                    None => event.captured_at,
                };
                table.open_version(
                    key.clone(),
                    event.payload,
                    valid_from,
                    event.sequence_id,
                    self.as_of,
                );
                self.outcome.versions_created += 1;
                self.replay(&key, |batch, waiting| {
                    batch.apply_dimension(table, waiting.event, waiting.retries)
                });
            }
            (ChangeAction::Insert | ChangeAction::Update, Some((attributes, valid_from))) => {
                let mut merged = attributes.clone();
                merged.extend(event.payload);
                if merged == attributes {
                    self.outcome.no_ops += 1;
                    return;
                }
                let effective = event.captured_at.max(valid_from);
                table.close_current(&key, effective);
                table.open_version(key, merged, effective, event.sequence_id, self.as_of);
                self.outcome.versions_closed += 1;
                self.outcome.versions_created += 1;
            }
            (ChangeAction::Delete, Some((_, valid_from))) => {
                table.close_current(&key, event.captured_at.max(valid_from));
                self.outcome.versions_closed += 1;
            }
            (ChangeAction::Update | ChangeAction::Delete, None) => self.buffer(event, retries),
        }
    }

    /// `trigger` is the ledger event being applied; replays run under the insert that released them
    fn apply_fact(&mut self, table: &mut FactTable, event: ChangeEvent, retries: u32, trigger: u64) {
        let key = event.key.clone();
        let previous = table.live_rows_for(&key).last().map(|r| (*r).clone());

        match (event.action, previous) {
            (ChangeAction::Update | ChangeAction::Delete, None) => self.buffer(event, retries),
            (ChangeAction::Delete, Some(_)) => {
                let compensations = table.compensate(&key, event.sequence_id, trigger, self.as_of);
                self.outcome.compensations += compensations.len();
                self.outcome.appended_facts.extend(compensations);
            }
            (action, previous) => {
                let row = match self.build_fact(&event, previous.as_ref()) {
                    Ok(row) => row,
                    Err(reason) => {
                        self.row_anomaly(&event, reason);
                        return;
                    }
                };
                if previous.is_some() {
                    let compensations =
                        table.compensate(&key, event.sequence_id, trigger, self.as_of);
                    self.outcome.compensations += compensations.len();
                    self.outcome.appended_facts.extend(compensations);
                }
                let appended = table.append(row, trigger);
                self.outcome.facts_appended += 1;
                self.outcome.appended_facts.push(appended);

                if action == ChangeAction::Insert {
                    self.replay(&key, |batch, waiting| {
                        batch.apply_fact(table, waiting.event, waiting.retries, trigger)
                    });
                }
            }
        }
    }

    fn replay<F>(&mut self, key: &NaturalKey, mut apply: F)
    where
        F: FnMut(&mut Self, PendingEvent),
    {
        for waiting in self.pending.take(key) {
            debug!(
                dataset = %self.mapping.dataset,
                sequence_id = waiting.event.sequence_id,
                key = %key,
                "Replaying buffered event"
            );
            self.outcome.replayed += 1;
            apply(self, waiting);
        }
    }

    fn buffer(&mut self, event: ChangeEvent, retries: u32) {
        debug!(
            dataset = %self.mapping.dataset,
            sequence_id = event.sequence_id,
            key = %event.key,
            action = %event.action,
            "No predecessor yet, buffering"
        );
        self.outcome.buffered += 1;
        self.pending.push(event, retries);
    }

    fn row_anomaly(&mut self, event: &ChangeEvent, reason: String) {
        self.outcome.row_anomalies.push(
            Anomaly::new(AnomalyKind::SchemaMismatch, &self.mapping.dataset, reason)
                .with_event(event),
        );
    }

    fn build_fact(&self, event: &ChangeEvent, previous: Option<&FactRow>) -> std::result::Result<FactRow, String> {
        let mut measures = BTreeMap::new();
        for name in &self.mapping.measures {
            let value = match event.payload.get(name) {
                None | Some(Value::Null) => previous
                    .and_then(|p| p.measures.get(name).copied())
                    .ok_or_else(|| format!("missing measure '{}'", name))?,
                Some(value) => numeric(value)
                    .ok_or_else(|| format!("measure '{}' is not numeric: {}", name, value))?,
            };
            measures.insert(name.clone(), value);
        }

        let mut dimension_keys = BTreeMap::new();
        for reference in &self.mapping.references {
            let dimension = self
                .catalog
                .get(&reference.dimension)
                .and_then(DatasetState::dimension);

            let untouched = reference
                .source_columns
                .iter()
                .all(|c| !event.payload.contains_key(c));
            let inherited = previous
                .filter(|_| untouched)
                .and_then(|p| p.dimension_keys.get(&reference.dimension))
                .and_then(|&sk| dimension.and_then(|t| t.by_surrogate(sk)))
                .map(|v| v.natural_key.clone());

            let business_key = match inherited {
                Some(key) => key,
                None => NaturalKey::from_columns(
                    &event.payload,
                    &reference.source_columns,
                    &reference.target_columns,
                )
                .map_err(|e| e.message)?,
            };

            let surrogate_key = dimension
                .and_then(|t| t.version_at(&business_key, event.captured_at))
                .map(|v| v.surrogate_key)
                .ok_or_else(|| {
                    format!(
                        "unresolvable reference: {} has no entity {}",
                        reference.dimension, business_key
                    )
                })?;
            dimension_keys.insert(reference.dimension.clone(), surrogate_key);
        }

        Ok(FactRow {
            fact_id: 0,
            dataset: self.mapping.dataset.clone(),
            natural_key: event.key.clone(),
            dimension_keys,
            measures,
            event_time: event.captured_at,
            source_sequence_id: event.sequence_id,
            is_compensation: false,
            loaded_at: self.as_of,
        })
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
