//! Domain layer for the scdflow change ledger and sink catalog
//!
//! # Core Principles
//!
//! 1. **Ordering Authority**: `sequence_id` is strictly increasing per dataset and
//!    is the only ordering that matters. Capture timestamps are data, not order.
//! 2. **Immutability**: change events, fact rows and closed entity versions are
//!    never rewritten. Corrections are new rows.
//! 3. **Consumer-owned Cursors**: each consumer tracks how far it has read a
//!    dataset; cursors only move forward through compare-and-swap.
//!
//! # Domain Models
//!
//! - `ChangeEvent`: one captured insert/update/delete against a dataset
//! - `Cursor`: a consumer's read position in a dataset
//! - `VersionedEntity`: an SCD2 dimension row
//! - `FactRow`: an immutable measurement row
//! - `AggregateRow`: a derived rollup bucket
//! - `Anomaly`: a persisted record of a row or batch that could not be applied
//!
//! # Port Trait
//!
//! - `LedgerStore`: durable storage for events, cursors and anomalies

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StorageError};

/// Column name → value for a staged row, entity attributes or event payload.
pub type Row = BTreeMap<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════

/// Natural (business) key of a row
///
/// Key columns are rendered to canonical strings so that `1` and `"1"` in two
/// different payloads of the same dataset never produce two different entities
/// for what is the same business identifier.
///
/// # Examples
///
/// ```rust
/// use scdflow_storage::domain::{NaturalKey, Row};
/// use serde_json::json;
///
/// let mut row = Row::new();
/// row.insert("customer_id".to_string(), json!(42));
/// row.insert("name".to_string(), json!("Alice"));
///
/// let key = NaturalKey::from_row(&row, &["customer_id".to_string()]).unwrap();
/// assert_eq!(key.get("customer_id"), Some("42"));
/// assert_eq!(key.to_string(), "customer_id=42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(BTreeMap<String, String>);

impl NaturalKey {
    /// Extract the declared key columns from a row.
    ///
    /// Fails with `SchemaMismatch` if a column is missing, null, or not a scalar.
    pub fn from_row(row: &Row, key_columns: &[String]) -> Result<Self> {
        Self::from_columns(row, key_columns, key_columns)
    }

    /// Build a key for another dataset from columns of this row.
    ///
    /// `source_columns[i]` of `row` becomes `target_columns[i]` of the key. Used to
    /// turn a fact's foreign key columns into the referenced dimension's key.
    pub fn from_columns(
        row: &Row,
        source_columns: &[String],
        target_columns: &[String],
    ) -> Result<Self> {
        if source_columns.is_empty() {
            return Err(StorageError::config("natural key needs at least one column"));
        }
        if source_columns.len() != target_columns.len() {
            return Err(StorageError::config(format!(
                "key column count mismatch: {} source columns for {} target columns",
                source_columns.len(),
                target_columns.len()
            )));
        }

        let mut parts = BTreeMap::new();
        for (source, target) in source_columns.iter().zip(target_columns) {
            let value = row.get(source).ok_or_else(|| {
                StorageError::schema_mismatch(format!("missing key column '{}'", source))
            })?;
            let rendered = render_key_value(value).ok_or_else(|| {
                StorageError::schema_mismatch(format!(
                    "key column '{}' must be a non-null scalar, got {}",
                    source, value
                ))
            })?;
            parts.insert(target.clone(), rendered);
        }
        Ok(Self(parts))
    }

    /// Single-column key
    pub fn single(column: impl Into<String>, value: impl Into<String>) -> Self {
        let mut parts = BTreeMap::new();
        parts.insert(column.into(), value.into());
        Self(parts)
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Key columns as a payload row (string values)
    pub fn to_row(&self) -> Row {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect()
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", rendered.join(","))
    }
}

fn render_key_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Change Events
// ═══════════════════════════════════════════════════════════════════════════

/// Kind of captured change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "INSERT",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeAction::Insert),
            "UPDATE" => Ok(ChangeAction::Update),
            "DELETE" => Ok(ChangeAction::Delete),
            _ => Err(StorageError::serialization(format!(
                "Invalid change action: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed row from the raw row source, stamped with its source time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub values: Row,
    pub event_time: DateTime<Utc>,
}

impl SourceRow {
    pub fn new(values: Row, event_time: DateTime<Utc>) -> Self {
        Self { values, event_time }
    }
}

/// A change that has been validated but not yet sequenced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChangeEvent {
    pub key: NaturalKey,
    pub action: ChangeAction,
    pub payload: Row,
    pub captured_at: DateTime<Utc>,
}

/// Immutable, sequenced change event
///
/// `sequence_id` starts at 1 for each dataset and increases by one per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence_id: u64,
    pub dataset: String,
    pub key: NaturalKey,
    pub action: ChangeAction,
    pub payload: Row,
    pub captured_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn from_new(dataset: &str, sequence_id: u64, event: NewChangeEvent) -> Self {
        Self {
            sequence_id,
            dataset: dataset.to_string(),
            key: event.key,
            action: event.action,
            payload: event.payload,
            captured_at: event.captured_at,
        }
    }
}

/// Read position of one consumer in one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub consumer_id: String,
    pub dataset: String,
    pub last_sequence_id: u64,
    pub updated_at: DateTime<Utc>,
}

impl Cursor {
    /// Cursor of a consumer that has not read anything yet
    pub fn initial(consumer_id: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            dataset: dataset.into(),
            last_sequence_id: 0,
            updated_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sink Catalog Rows
// ═══════════════════════════════════════════════════════════════════════════

/// SCD2 dimension row
///
/// `valid_to = None` means the version is still open. A closed version never
/// changes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntity {
    pub natural_key: NaturalKey,
    pub surrogate_key: u64,
    pub attributes: Row,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
    /// Ledger event that opened this version
    pub source_sequence_id: u64,
    pub loaded_at: DateTime<Utc>,
}

impl VersionedEntity {
    /// Whether `at` falls inside `[valid_from, valid_to)`
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |end| at < end)
    }
}

/// Immutable fact row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub fact_id: u64,
    pub dataset: String,
    /// The fact's own business key (used to find rows to compensate)
    pub natural_key: NaturalKey,
    /// Dimension name → surrogate key effective at `event_time`
    pub dimension_keys: BTreeMap<String, u64>,
    pub measures: BTreeMap<String, f64>,
    pub event_time: DateTime<Utc>,
    pub source_sequence_id: u64,
    pub is_compensation: bool,
    pub loaded_at: DateTime<Utc>,
}

/// Time bucket size for aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
        }
    }

    /// Start of the bucket containing `at`
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let naive = match self {
            Granularity::Hour => at.date_naive().and_hms_opt(at.hour(), 0, 0),
            Granularity::Day => at.date_naive().and_hms_opt(0, 0, 0),
            Granularity::Month => NaiveDate::from_ymd_opt(at.year(), at.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        };
        naive.map(|n| Utc.from_utc_datetime(&n)).unwrap_or(at)
    }
}

/// Aggregate period (bucket start + granularity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
}

impl Period {
    pub fn containing(granularity: Granularity, at: DateTime<Utc>) -> Self {
        Self {
            granularity,
            start: granularity.truncate(at),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.granularity.truncate(at) == self.start
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.granularity.as_str(), self.start.to_rfc3339())
    }
}

/// Derived rollup bucket. A cache: reproducible from facts and dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub aggregate: String,
    pub grouping_key: String,
    pub period: Period,
    pub measures: BTreeMap<String, f64>,
    pub fact_count: usize,
    pub refreshed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Anomalies
// ═══════════════════════════════════════════════════════════════════════════

/// Kind of data anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Row failed schema checks and was skipped
    SchemaMismatch,
    /// Update/delete never found its predecessor
    OrphanEvent,
    /// Batch failed the validation gate
    ValidationRejected,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::SchemaMismatch => "schema_mismatch",
            AnomalyKind::OrphanEvent => "orphan_event",
            AnomalyKind::ValidationRejected => "validation_rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "schema_mismatch" => Ok(AnomalyKind::SchemaMismatch),
            "orphan_event" => Ok(AnomalyKind::OrphanEvent),
            "validation_rejected" => Ok(AnomalyKind::ValidationRejected),
            _ => Err(StorageError::serialization(format!(
                "Invalid anomaly kind: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted record of data that could not be applied, with its reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub kind: AnomalyKind,
    pub dataset: String,
    pub sequence_id: Option<u64>,
    pub natural_key: Option<NaturalKey>,
    pub reason: String,
    /// Offending row, event or violation list
    #[serde(default)]
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, dataset: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            dataset: dataset.into(),
            sequence_id: None,
            natural_key: None,
            reason: reason.into(),
            details: serde_json::Value::Null,
            detected_at: Utc::now(),
        }
    }

    pub fn with_event(mut self, event: &ChangeEvent) -> Self {
        self.sequence_id = Some(event.sequence_id);
        self.natural_key = Some(event.key.clone());
        self.details = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Durable storage for the change ledger
///
/// Owns change events (append-only), consumer cursors and anomaly records.
///
/// # Contract
///
/// - `append_events` assigns consecutive sequence ids atomically per dataset;
///   concurrent appends never interleave ids or lose events.
/// - `read_events` returns events with `after < sequence_id <= until` in
///   sequence order, at most `limit` of them.
/// - `compare_and_swap_cursor` only succeeds if the stored cursor still equals
///   `expected` (an absent cursor equals 0) and `new >= expected`.
///
/// # Examples
///
/// ```rust,ignore
/// let appended = store.append_events("customers", events).await?;
/// let slice = store.read_events("customers", cursor.last_sequence_id, None, 500).await?;
/// store
///     .compare_and_swap_cursor("merge_dimension:customers", "customers", 0, 42)
///     .await?;
/// ```
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Sequence and persist events; returns them with their assigned ids.
    async fn append_events(
        &self,
        dataset: &str,
        events: Vec<NewChangeEvent>,
    ) -> Result<Vec<ChangeEvent>>;

    /// Ordered slice of events after `after` (and at most `until`, if given).
    async fn read_events(
        &self,
        dataset: &str,
        after: u64,
        until: Option<u64>,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>>;

    /// Latest assigned sequence id (0 if the dataset is empty)
    async fn head_sequence(&self, dataset: &str) -> Result<u64>;

    /// Current cursor; an unknown consumer starts at 0.
    async fn load_cursor(&self, consumer_id: &str, dataset: &str) -> Result<Cursor>;

    /// Atomically move a cursor from `expected` to `new`.
    ///
    /// Fails with `ErrorKind::CasConflict` if the cursor moved in between.
    async fn compare_and_swap_cursor(
        &self,
        consumer_id: &str,
        dataset: &str,
        expected: u64,
        new: u64,
    ) -> Result<Cursor>;

    /// Persist an anomaly record
    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<()>;

    /// All anomalies, optionally for one dataset, oldest first
    async fn list_anomalies(&self, dataset: Option<&str>) -> Result<Vec<Anomaly>>;
}
