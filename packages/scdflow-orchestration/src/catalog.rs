//! Sink catalog
//!
//! Named versioned tables written by the merge engine and aggregate maintainer.
//! Outside the crate the catalog is read through [`CatalogReader`] only.
//!
//! Each dataset's [`DatasetState`] holds its table, its orphan buffer, the
//! `applied_through` watermark and quarantined rows. The merge engine swaps a
//! whole `DatasetState` in one write-locked step, which is what makes a batch
//! commit atomic.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use scdflow_storage::{
    AggregateRow, Anomaly, ChangeEvent, FactRow, NaturalKey, Period, Row, VersionedEntity,
};
use serde::{Deserialize, Serialize};

use crate::config::DatasetKind;

// ═══════════════════════════════════════════════════════════════════════════
// Dimension table
// ═══════════════════════════════════════════════════════════════════════════

/// SCD2 versions of every entity of one dimension
#[derive(Debug, Clone, Default)]
pub struct DimensionTable {
    versions: Vec<VersionedEntity>,
    /// natural key → version indices in `valid_from` order
    by_key: HashMap<NaturalKey, Vec<usize>>,
    by_surrogate: HashMap<u64, usize>,
    next_surrogate: u64,
}

impl DimensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, key: &NaturalKey) -> Option<&VersionedEntity> {
        self.last_version(key).filter(|v| v.is_current)
    }

    /// Latest version, current or closed
    pub fn last_version(&self, key: &NaturalKey) -> Option<&VersionedEntity> {
        self.by_key
            .get(key)
            .and_then(|idx| idx.last())
            .map(|&i| &self.versions[i])
    }

    pub fn history(&self, key: &NaturalKey) -> Vec<&VersionedEntity> {
        self.by_key
            .get(key)
            .map(|idx| idx.iter().map(|&i| &self.versions[i]).collect())
            .unwrap_or_default()
    }

    /// Version effective at `at`
    ///
    /// The latest version with `valid_from <= at`: the covering version, or the
    /// last one before a deletion gap. Before the first version, the first one.
    pub fn version_at(&self, key: &NaturalKey, at: DateTime<Utc>) -> Option<&VersionedEntity> {
        let idx = self.by_key.get(key)?;
        idx.iter()
            .rev()
            .map(|&i| &self.versions[i])
            .find(|v| v.valid_from <= at)
            .or_else(|| idx.first().map(|&i| &self.versions[i]))
    }

    pub fn by_surrogate(&self, surrogate_key: u64) -> Option<&VersionedEntity> {
        self.by_surrogate
            .get(&surrogate_key)
            .map(|&i| &self.versions[i])
    }

    pub fn contains_key(&self, key: &NaturalKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn versions(&self) -> &[VersionedEntity] {
        &self.versions
    }

    pub fn current_versions(&self) -> impl Iterator<Item = &VersionedEntity> {
        self.versions.iter().filter(|v| v.is_current)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Open a new current version; returns its surrogate key
    pub(crate) fn open_version(
        &mut self,
        key: NaturalKey,
        attributes: Row,
        valid_from: DateTime<Utc>,
        source_sequence_id: u64,
        loaded_at: DateTime<Utc>,
    ) -> u64 {
        self.next_surrogate += 1;
        let surrogate_key = self.next_surrogate;
        let index = self.versions.len();

        self.versions.push(VersionedEntity {
            natural_key: key.clone(),
            surrogate_key,
            attributes,
            valid_from,
            valid_to: None,
            is_current: true,
            source_sequence_id,
            loaded_at,
        });
        self.by_key.entry(key).or_default().push(index);
        self.by_surrogate.insert(surrogate_key, index);
        surrogate_key
    }

    /// Close the current version at `valid_to`; returns its surrogate key
    pub(crate) fn close_current(&mut self, key: &NaturalKey, valid_to: DateTime<Utc>) -> Option<u64> {
        let &index = self.by_key.get(key)?.last()?;
        let version = &mut self.versions[index];
        if !version.is_current {
            return None;
        }
        version.valid_to = Some(valid_to);
        version.is_current = false;
        Some(version.surrogate_key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fact table
// ═══════════════════════════════════════════════════════════════════════════

/// Append-only fact rows
///
/// A row is *live* until a later UPDATE/DELETE of its key compensates it.
/// Compensation rows are never live. Summing live rows equals summing all rows.
#[derive(Debug, Clone, Default)]
pub struct FactTable {
    rows: Vec<FactRow>,
    live: Vec<bool>,
    /// natural key → indices of live rows
    live_by_key: HashMap<NaturalKey, Vec<usize>>,
    /// sequence id of the event whose application wrote the row → row indices.
    /// A replayed orphan is filed under the event that released it.
    by_sequence: BTreeMap<u64, Vec<usize>>,
    next_fact_id: u64,
}

impl FactTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[FactRow] {
        &self.rows
    }

    pub fn live_rows(&self) -> impl Iterator<Item = &FactRow> {
        self.rows
            .iter()
            .zip(&self.live)
            .filter(|(_, live)| **live)
            .map(|(row, _)| row)
    }

    pub fn live_rows_for(&self, key: &NaturalKey) -> Vec<&FactRow> {
        self.live_by_key
            .get(key)
            .map(|idx| idx.iter().map(|&i| &self.rows[i]).collect())
            .unwrap_or_default()
    }

    /// Rows written by ledger events in `(after, until]`, compensations included
    pub fn rows_for_sequences(&self, after: u64, until: u64) -> Vec<&FactRow> {
        if until <= after {
            return Vec::new();
        }
        self.by_sequence
            .range((Bound::Excluded(after), Bound::Included(until)))
            .flat_map(|(_, idx)| idx.iter().map(|&i| &self.rows[i]))
            .collect()
    }

    /// Net measures of a key across all its rows
    pub fn net_measures(&self, key: &NaturalKey) -> BTreeMap<String, f64> {
        let mut net = BTreeMap::new();
        for row in self.live_rows_for(key) {
            for (name, value) in &row.measures {
                *net.entry(name.clone()).or_insert(0.0) += value;
            }
        }
        net
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a live fact written while applying event `written_by`; assigns `fact_id`
    pub(crate) fn append(&mut self, mut row: FactRow, written_by: u64) -> FactRow {
        self.next_fact_id += 1;
        row.fact_id = self.next_fact_id;
        row.is_compensation = false;

        let index = self.push(row.clone(), true, written_by);
        self.live_by_key
            .entry(row.natural_key.clone())
            .or_default()
            .push(index);
        row
    }

    /// Negate every live row of `key`; returns the compensation rows
    pub(crate) fn compensate(
        &mut self,
        key: &NaturalKey,
        source_sequence_id: u64,
        written_by: u64,
        loaded_at: DateTime<Utc>,
    ) -> Vec<FactRow> {
        let Some(indices) = self.live_by_key.remove(key) else {
            return Vec::new();
        };

        let mut compensations = Vec::with_capacity(indices.len());
        for index in indices {
            self.live[index] = false;
            let original = &self.rows[index];

            self.next_fact_id += 1;
            let compensation = FactRow {
                fact_id: self.next_fact_id,
                dataset: original.dataset.clone(),
                natural_key: original.natural_key.clone(),
                dimension_keys: original.dimension_keys.clone(),
                measures: original
                    .measures
                    .iter()
                    .map(|(name, value)| (name.clone(), -value))
                    .collect(),
                // Same bucket as the row it cancels
                event_time: original.event_time,
                source_sequence_id,
                is_compensation: true,
                loaded_at,
            };
            self.push(compensation.clone(), false, written_by);
            compensations.push(compensation);
        }
        compensations
    }

    fn push(&mut self, row: FactRow, live: bool, written_by: u64) -> usize {
        let index = self.rows.len();
        self.by_sequence
            .entry(written_by)
            .or_default()
            .push(index);
        self.rows.push(row);
        self.live.push(live);
        index
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Orphan buffer
// ═══════════════════════════════════════════════════════════════════════════

/// Update/delete waiting for its predecessor
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event: ChangeEvent,
    /// Batches seen since it was buffered
    pub retries: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PendingBuffer {
    entries: BTreeMap<NaturalKey, Vec<PendingEvent>>,
}

impl PendingBuffer {
    /// Buffer an event, keeping per-key sequence order
    pub(crate) fn push(&mut self, event: ChangeEvent, retries: u32) {
        let queue = self.entries.entry(event.key.clone()).or_default();
        if queue.iter().any(|p| p.event.sequence_id == event.sequence_id) {
            return;
        }
        let at = queue.partition_point(|p| p.event.sequence_id < event.sequence_id);
        queue.insert(at, PendingEvent { event, retries });
    }

    pub(crate) fn take(&mut self, key: &NaturalKey) -> Vec<PendingEvent> {
        self.entries.remove(key).unwrap_or_default()
    }

    /// Count one more retry for everything still waiting; return those over `limit`
    pub(crate) fn age(&mut self, limit: u32) -> Vec<PendingEvent> {
        let mut expired = Vec::new();
        self.entries.retain(|_, queue| {
            for pending in queue.iter_mut() {
                pending.retries += 1;
            }
            let (over, keep): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|p| p.retries > limit);
            expired.extend(over);
            *queue = keep;
            !queue.is_empty()
        });
        expired.sort_by_key(|p| p.event.sequence_id);
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &PendingEvent> {
        self.entries.values().flatten()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dataset state
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum TableData {
    Dimension(DimensionTable),
    Fact(FactTable),
}

/// Everything the merge engine owns for one dataset
#[derive(Debug, Clone)]
pub struct DatasetState {
    pub table: TableData,
    pub pending: PendingBuffer,
    /// Highest ledger sequence id applied (exactly-once watermark)
    pub applied_through: u64,
    /// Rows that could not be applied, with reasons
    pub quarantine: Vec<Anomaly>,
    /// Bumped by every commit
    pub generation: u64,
}

impl DatasetState {
    pub fn new(kind: DatasetKind) -> Self {
        let table = match kind {
            DatasetKind::Dimension => TableData::Dimension(DimensionTable::new()),
            DatasetKind::Fact => TableData::Fact(FactTable::new()),
        };
        Self {
            table,
            pending: PendingBuffer::default(),
            applied_through: 0,
            quarantine: Vec::new(),
            generation: 0,
        }
    }

    pub fn kind(&self) -> DatasetKind {
        match self.table {
            TableData::Dimension(_) => DatasetKind::Dimension,
            TableData::Fact(_) => DatasetKind::Fact,
        }
    }

    pub fn dimension(&self) -> Option<&DimensionTable> {
        match &self.table {
            TableData::Dimension(table) => Some(table),
            TableData::Fact(_) => None,
        }
    }

    pub fn facts(&self) -> Option<&FactTable> {
        match &self.table {
            TableData::Fact(table) => Some(table),
            TableData::Dimension(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════════

type AggregateBuckets = BTreeMap<(String, Period), AggregateRow>;

#[derive(Debug, Default)]
pub struct SinkCatalog {
    name: String,
    datasets: RwLock<HashMap<String, DatasetState>>,
    aggregates: RwLock<HashMap<String, AggregateBuckets>>,
}

impl SinkCatalog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn datasets(&self) -> RwLockReadGuard<'_, HashMap<String, DatasetState>> {
        self.datasets.read()
    }

    pub(crate) fn datasets_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, DatasetState>> {
        self.datasets.write()
    }

    pub(crate) fn aggregates_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, AggregateBuckets>> {
        self.aggregates.write()
    }

    /// Serializable copy of every table
    pub fn snapshot(&self) -> CatalogSnapshot {
        let datasets = self.datasets.read();
        let mut snapshot = CatalogSnapshot {
            name: self.name.clone(),
            ..Default::default()
        };

        for (name, state) in datasets.iter() {
            snapshot
                .watermarks
                .insert(name.clone(), state.applied_through);
            match &state.table {
                TableData::Dimension(table) => {
                    snapshot
                        .dimensions
                        .insert(name.clone(), table.versions().to_vec());
                }
                TableData::Fact(table) => {
                    snapshot.facts.insert(name.clone(), table.rows().to_vec());
                }
            }
            if !state.quarantine.is_empty() {
                snapshot
                    .quarantine
                    .insert(name.clone(), state.quarantine.clone());
            }
        }

        for (name, buckets) in self.aggregates.read().iter() {
            snapshot
                .aggregates
                .insert(name.clone(), buckets.values().cloned().collect());
        }
        snapshot
    }
}

/// Point-in-time copy of a catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub name: String,
    pub dimensions: BTreeMap<String, Vec<VersionedEntity>>,
    pub facts: BTreeMap<String, Vec<FactRow>>,
    pub aggregates: BTreeMap<String, Vec<AggregateRow>>,
    pub watermarks: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quarantine: BTreeMap<String, Vec<Anomaly>>,
}

/// Read-only view of the sink catalog
pub trait CatalogReader: Send + Sync {
    /// Current version of every entity
    fn current_entities(&self, dataset: &str) -> Vec<VersionedEntity>;

    /// All versions of one entity, oldest first
    fn entity_history(&self, dataset: &str, key: &NaturalKey) -> Vec<VersionedEntity>;

    /// Version effective at `at`
    fn entity_at(&self, dataset: &str, key: &NaturalKey, at: DateTime<Utc>)
        -> Option<VersionedEntity>;

    /// Every version of every entity
    fn all_versions(&self, dataset: &str) -> Vec<VersionedEntity>;

    /// Whether the key was ever merged (current or closed)
    fn has_entity(&self, dataset: &str, key: &NaturalKey) -> bool;

    /// Full fact history including compensations
    fn facts(&self, dataset: &str) -> Vec<FactRow>;

    fn aggregates(&self, aggregate: &str) -> Vec<AggregateRow>;

    fn aggregate_row(&self, aggregate: &str, grouping_key: &str, period: Period)
        -> Option<AggregateRow>;

    fn applied_through(&self, dataset: &str) -> u64;

    fn quarantined(&self, dataset: &str) -> Vec<Anomaly>;

    /// Update/delete events still waiting for a predecessor
    fn pending_orphans(&self, dataset: &str) -> Vec<ChangeEvent>;
}

impl CatalogReader for SinkCatalog {
    fn current_entities(&self, dataset: &str) -> Vec<VersionedEntity> {
        self.datasets
            .read()
            .get(dataset)
            .and_then(DatasetState::dimension)
            .map(|t| t.current_versions().cloned().collect())
            .unwrap_or_default()
    }

    fn entity_history(&self, dataset: &str, key: &NaturalKey) -> Vec<VersionedEntity> {
        self.datasets
            .read()
            .get(dataset)
            .and_then(DatasetState::dimension)
            .map(|t| t.history(key).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    fn entity_at(
        &self,
        dataset: &str,
        key: &NaturalKey,
        at: DateTime<Utc>,
    ) -> Option<VersionedEntity> {
        self.datasets
            .read()
            .get(dataset)
            .and_then(DatasetState::dimension)
            .and_then(|t| t.version_at(key, at).cloned())
    }

    fn all_versions(&self, dataset: &str) -> Vec<VersionedEntity> {
        self.datasets
            .read()
            .get(dataset)
            .and_then(DatasetState::dimension)
            .map(|t| t.versions().to_vec())
            .unwrap_or_default()
    }

    fn has_entity(&self, dataset: &str, key: &NaturalKey) -> bool {
        self.datasets
            .read()
            .get(dataset)
            .and_then(DatasetState::dimension)
            .map_or(false, |t| t.contains_key(key))
    }

    fn facts(&self, dataset: &str) -> Vec<FactRow> {
        self.datasets
            .read()
            .get(dataset)
            .and_then(DatasetState::facts)
            .map(|t| t.rows().to_vec())
            .unwrap_or_default()
    }

    fn aggregates(&self, aggregate: &str) -> Vec<AggregateRow> {
        self.aggregates
            .read()
            .get(aggregate)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default()
    }

    fn aggregate_row(
        &self,
        aggregate: &str,
        grouping_key: &str,
        period: Period,
    ) -> Option<AggregateRow> {
        self.aggregates
            .read()
            .get(aggregate)
            .and_then(|b| b.get(&(grouping_key.to_string(), period)).cloned())
    }

    fn applied_through(&self, dataset: &str) -> u64 {
        self.datasets
            .read()
            .get(dataset)
            .map_or(0, |s| s.applied_through)
    }

    fn quarantined(&self, dataset: &str) -> Vec<Anomaly> {
        self.datasets
            .read()
            .get(dataset)
            .map(|s| s.quarantine.clone())
            .unwrap_or_default()
    }

    fn pending_orphans(&self, dataset: &str) -> Vec<ChangeEvent> {
        self.datasets
            .read()
            .get(dataset)
            .map(|s| s.pending.events().map(|p| p.event.clone()).collect())
            .unwrap_or_default()
    }
}
