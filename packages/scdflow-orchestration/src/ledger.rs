//! Change Ledger
//!
//! Ordered record of inserts, updates and deletes per dataset. Appends check the
//! natural key against the dataset declaration; a bad row is skipped and
//! reported, the rest of the call still goes through.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::stream::{self, Stream};
use scdflow_storage::{
    Anomaly, AnomalyKind, ChangeAction, ChangeEvent, LedgerStore, NaturalKey, NewChangeEvent,
    Row, SourceRow,
};
use serde_json::json;
use tracing::{debug, info};

use crate::anomaly::AnomalyReporter;
use crate::config::ScdflowConfig;
use crate::error::{OrchestratorError, Result};

/// Result of one append call
#[derive(Debug, Clone, Default)]
pub struct AppendReport {
    pub appended: Vec<ChangeEvent>,
    /// Rows that were skipped, one anomaly each
    pub rejected: Vec<Anomaly>,
}

impl AppendReport {
    /// Highest sequence id assigned by this call
    pub fn last_sequence_id(&self) -> Option<u64> {
        self.appended.last().map(|e| e.sequence_id)
    }
}

pub struct ChangeLedger {
    store: Arc<dyn LedgerStore>,
    /// dataset → declared key columns
    key_columns: HashMap<String, Vec<String>>,
    reporter: AnomalyReporter,
    page_size: usize,
}

impl ChangeLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: &ScdflowConfig, reporter: AnomalyReporter) -> Self {
        let key_columns = config
            .datasets
            .iter()
            .map(|d| (d.name.clone(), d.key_columns.clone()))
            .collect();
        Self {
            store,
            key_columns,
            reporter,
            page_size: config.engine.page_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn reporter(&self) -> &AnomalyReporter {
        &self.reporter
    }

    /// Sequence and persist `rows` as `action` events.
    ///
    /// A row without a complete natural key is skipped with a `SchemaMismatch`
    /// anomaly. DELETE events keep only the key columns.
    pub async fn append(
        &self,
        dataset: &str,
        rows: Vec<SourceRow>,
        action: ChangeAction,
    ) -> Result<AppendReport> {
        let key_columns = self
            .key_columns
            .get(dataset)
            .ok_or_else(|| OrchestratorError::UnknownDataset(dataset.to_string()))?;

        let mut report = AppendReport::default();
        let mut events = Vec::with_capacity(rows.len());

        for row in rows {
            match NaturalKey::from_row(&row.values, key_columns) {
                Ok(key) => {
                    let payload = match action {
                        ChangeAction::Delete => key_only(&row.values, key_columns),
                        ChangeAction::Insert | ChangeAction::Update => row.values,
                    };
                    events.push(NewChangeEvent {
                        key,
                        action,
                        payload,
                        captured_at: row.event_time,
                    });
                }
                Err(e) => {
                    let anomaly = Anomaly::new(AnomalyKind::SchemaMismatch, dataset, e.message)
                        .with_details(json!({
                            "action": action,
                            "event_time": row.event_time,
                            "row": row.values,
                        }));
                    self.reporter.report(&anomaly).await?;
                    report.rejected.push(anomaly);
                }
            }
        }

        if !events.is_empty() {
            report.appended = self.store.append_events(dataset, events).await?;
        }

        info!(
            dataset,
            action = %action,
            appended = report.appended.len(),
            rejected = report.rejected.len(),
            last_sequence_id = ?report.last_sequence_id(),
            "Appended change events"
        );
        Ok(report)
    }

    /// Lazy reader over events after `after`, at most `max_rows` of them
    pub fn read_since(&self, dataset: &str, after: u64, max_rows: usize) -> ChangeReader {
        self.read_range(dataset, after, None, max_rows)
    }

    /// Like [`read_since`](Self::read_since) but stops at `until` (inclusive)
    pub fn read_range(
        &self,
        dataset: &str,
        after: u64,
        until: Option<u64>,
        max_rows: usize,
    ) -> ChangeReader {
        ChangeReader {
            store: self.store.clone(),
            dataset: dataset.to_string(),
            position: after,
            fetched_through: after,
            until,
            remaining: max_rows,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            exhausted: max_rows == 0 || until.map_or(false, |u| u <= after),
        }
    }

    /// Latest assigned sequence id (0 when empty)
    pub async fn head(&self, dataset: &str) -> Result<u64> {
        Ok(self.store.head_sequence(dataset).await?)
    }

    pub fn is_declared(&self, dataset: &str) -> bool {
        self.key_columns.contains_key(dataset)
    }
}

fn key_only(values: &Row, key_columns: &[String]) -> Row {
    values
        .iter()
        .filter(|(column, _)| key_columns.contains(column))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

/// Finite, restartable slice of a dataset's ledger
///
/// Pages through the store on demand. `position()` is the sequence id of the
/// last event handed out; a new reader started there continues seamlessly.
pub struct ChangeReader {
    store: Arc<dyn LedgerStore>,
    dataset: String,
    position: u64,
    fetched_through: u64,
    until: Option<u64>,
    remaining: usize,
    page_size: usize,
    buffer: VecDeque<ChangeEvent>,
    exhausted: bool,
}

impl ChangeReader {
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        match self.buffer.pop_front() {
            Some(event) => {
                self.position = event.sequence_id;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Drain the rest of the slice
    pub async fn collect_all(mut self) -> Result<Vec<ChangeEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await? {
            events.push(event);
        }
        Ok(events)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent>> {
        stream::try_unfold(self, |mut reader| async move {
            let next = reader.next_event().await?;
            Ok::<_, OrchestratorError>(next.map(|event| (event, reader)))
        })
    }

    async fn fill(&mut self) -> Result<()> {
        let want = self.page_size.min(self.remaining);
        let page = self
            .store
            .read_events(&self.dataset, self.fetched_through, self.until, want)
            .await?;

        debug!(
            dataset = %self.dataset,
            after = self.fetched_through,
            requested = want,
            received = page.len(),
            "Fetched ledger page"
        );

        if page.len() < want {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.fetched_through = last.sequence_id;
        }
        self.remaining -= page.len();
        if self.remaining == 0 {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::MemoryAnomalySink;
    use crate::config::DatasetConfig;
    use chrono::Utc;
    use futures::TryStreamExt;
    use scdflow_storage::InMemoryLedgerStore;

    fn ledger(page_size: usize) -> (ChangeLedger, Arc<MemoryAnomalySink>) {
        let mut config = ScdflowConfig::new()
            .with_dataset(DatasetConfig::dimension("customers", &["customer_id"]));
        config.engine.page_size = page_size;

        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        let sink = Arc::new(MemoryAnomalySink::new());
        let reporter = AnomalyReporter::new(store.clone(), sink.clone());
        (ChangeLedger::new(store, &config, reporter), sink)
    }

    fn row(id: serde_json::Value, name: &str) -> SourceRow {
        let mut values = Row::new();
        values.insert("customer_id".to_string(), id);
        values.insert("name".to_string(), json!(name));
        SourceRow::new(values, Utc::now())
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_ids() {
        let (ledger, _) = ledger(10);
        let report = ledger
            .append(
                "customers",
                vec![row(json!(1), "Alice"), row(json!(2), "Bob")],
                ChangeAction::Insert,
            )
            .await
            .unwrap();

        assert_eq!(
            report.appended.iter().map(|e| e.sequence_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(report.appended[0].key, NaturalKey::single("customer_id", "1"));
        assert_eq!(ledger.head("customers").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bad_row_is_skipped_and_reported() {
        let (ledger, sink) = ledger(10);
        let mut keyless = Row::new();
        keyless.insert("name".to_string(), json!("Nobody"));

        let report = ledger
            .append(
                "customers",
                vec![
                    row(json!(1), "Alice"),
                    SourceRow::new(keyless, Utc::now()),
                    row(json!(null), "Null"),
                    row(json!(2), "Bob"),
                ],
                ChangeAction::Insert,
            )
            .await
            .unwrap();

        assert_eq!(report.appended.len(), 2);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(sink.of_kind(AnomalyKind::SchemaMismatch).len(), 2);
        assert!(report.rejected[0].reason.contains("customer_id"));

        let persisted = ledger.store().list_anomalies(Some("customers")).await.unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_payload_keeps_only_key() {
        let (ledger, _) = ledger(10);
        let report = ledger
            .append("customers", vec![row(json!(1), "Alice")], ChangeAction::Delete)
            .await
            .unwrap();

        let payload = &report.appended[0].payload;
        assert_eq!(payload.len(), 1);
        assert_eq!(payload["customer_id"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let (ledger, _) = ledger(10);
        let err = ledger
            .append("ghosts", vec![row(json!(1), "x")], ChangeAction::Insert)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownDataset(_)));
    }

    #[tokio::test]
    async fn test_reader_pages_and_bounds() {
        let (ledger, _) = ledger(3);
        let rows = (1..=10).map(|i| row(json!(i), "x")).collect();
        ledger
            .append("customers", rows, ChangeAction::Insert)
            .await
            .unwrap();

        let mut reader = ledger.read_since("customers", 2, 5);
        let mut seen = Vec::new();
        while let Some(event) = reader.next_event().await.unwrap() {
            seen.push(event.sequence_id);
        }
        assert_eq!(seen, vec![3, 4, 5, 6, 7]);
        assert_eq!(reader.position(), 7);

        // Restart where the first reader stopped
        let rest = ledger
            .read_since("customers", reader.position(), 100)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(
            rest.iter().map(|e| e.sequence_id).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );

        let bounded = ledger
            .read_range("customers", 0, Some(4), 100)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(bounded.len(), 4);

        assert!(ledger
            .read_since("customers", 10, 100)
            .collect_all()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reader_as_stream() {
        let (ledger, _) = ledger(2);
        let rows = (1..=5).map(|i| row(json!(i), "x")).collect();
        ledger
            .append("customers", rows, ChangeAction::Insert)
            .await
            .unwrap();

        let events: Vec<ChangeEvent> = ledger
            .read_since("customers", 0, 100)
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 5);
        assert!(events.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
    }
}
