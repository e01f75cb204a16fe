use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::domain::{Anomaly, ChangeEvent, Cursor, LedgerStore, NewChangeEvent};
use crate::{Result, StorageError};

#[derive(Default)]
struct MemoryState {
    /// dataset → events ordered by sequence_id
    events: HashMap<String, Vec<ChangeEvent>>,
    /// (consumer_id, dataset) → cursor
    cursors: HashMap<(String, String), Cursor>,
    anomalies: Vec<Anomaly>,
}

/// In-memory ledger store
///
/// A single mutex serializes appends and cursor swaps, which is what makes
/// sequence assignment and CAS atomic. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append_events(
        &self,
        dataset: &str,
        events: Vec<NewChangeEvent>,
    ) -> Result<Vec<ChangeEvent>> {
        let mut state = self.state.lock();
        let log = state.events.entry(dataset.to_string()).or_default();

        let mut next = log.last().map_or(0, |e| e.sequence_id);
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            next += 1;
            let sequenced = ChangeEvent::from_new(dataset, next, event);
            log.push(sequenced.clone());
            appended.push(sequenced);
        }
        Ok(appended)
    }

    async fn read_events(
        &self,
        dataset: &str,
        after: u64,
        until: Option<u64>,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let state = self.state.lock();
        let Some(log) = state.events.get(dataset) else {
            return Ok(Vec::new());
        };

        let start = log.partition_point(|e| e.sequence_id <= after);
        Ok(log[start..]
            .iter()
            .take_while(|e| until.map_or(true, |u| e.sequence_id <= u))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn head_sequence(&self, dataset: &str) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .events
            .get(dataset)
            .and_then(|log| log.last())
            .map_or(0, |e| e.sequence_id))
    }

    async fn load_cursor(&self, consumer_id: &str, dataset: &str) -> Result<Cursor> {
        let state = self.state.lock();
        Ok(state
            .cursors
            .get(&(consumer_id.to_string(), dataset.to_string()))
            .cloned()
            .unwrap_or_else(|| Cursor::initial(consumer_id, dataset)))
    }

    async fn compare_and_swap_cursor(
        &self,
        consumer_id: &str,
        dataset: &str,
        expected: u64,
        new: u64,
    ) -> Result<Cursor> {
        if new < expected {
            return Err(StorageError::transaction(format!(
                "cursor {}@{} cannot move backwards from {} to {}",
                consumer_id, dataset, expected, new
            )));
        }

        let mut state = self.state.lock();
        let key = (consumer_id.to_string(), dataset.to_string());
        let actual = state.cursors.get(&key).map_or(0, |c| c.last_sequence_id);
        if actual != expected {
            return Err(StorageError::cas_conflict(
                consumer_id,
                dataset,
                expected,
                actual,
            ));
        }

        let cursor = Cursor {
            consumer_id: consumer_id.to_string(),
            dataset: dataset.to_string(),
            last_sequence_id: new,
            updated_at: Utc::now(),
        };
        state.cursors.insert(key, cursor.clone());
        Ok(cursor)
    }

    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        self.state.lock().anomalies.push(anomaly.clone());
        Ok(())
    }

    async fn list_anomalies(&self, dataset: Option<&str>) -> Result<Vec<Anomaly>> {
        let state = self.state.lock();
        Ok(state
            .anomalies
            .iter()
            .filter(|a| dataset.map_or(true, |d| a.dataset == d))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnomalyKind, ChangeAction, NaturalKey, Row};
    use crate::ErrorKind;

    fn new_event(id: u32) -> NewChangeEvent {
        NewChangeEvent {
            key: NaturalKey::single("id", id.to_string()),
            action: ChangeAction::Insert,
            payload: Row::new(),
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sequence_ids_are_per_dataset() {
        let store = InMemoryLedgerStore::new();

        let a = store
            .append_events("customers", vec![new_event(1), new_event(2)])
            .await
            .unwrap();
        let b = store
            .append_events("orders", vec![new_event(1)])
            .await
            .unwrap();
        let c = store
            .append_events("customers", vec![new_event(3)])
            .await
            .unwrap();

        assert_eq!(
            a.iter().map(|e| e.sequence_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(b[0].sequence_id, 1);
        assert_eq!(c[0].sequence_id, 3);
        assert_eq!(store.head_sequence("customers").await.unwrap(), 3);
        assert_eq!(store.head_sequence("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_events_bounds() {
        let store = InMemoryLedgerStore::new();
        store
            .append_events("ds", (1..=10).map(new_event).collect())
            .await
            .unwrap();

        let slice = store.read_events("ds", 3, None, 4).await.unwrap();
        assert_eq!(
            slice.iter().map(|e| e.sequence_id).collect::<Vec<_>>(),
            vec![4, 5, 6, 7]
        );

        let bounded = store.read_events("ds", 3, Some(5), 100).await.unwrap();
        assert_eq!(bounded.len(), 2);

        let empty = store.read_events("ds", 10, None, 100).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_cursor_cas() {
        let store = InMemoryLedgerStore::new();

        let initial = store.load_cursor("c1", "ds").await.unwrap();
        assert_eq!(initial.last_sequence_id, 0);

        store.compare_and_swap_cursor("c1", "ds", 0, 5).await.unwrap();

        let stale = store.compare_and_swap_cursor("c1", "ds", 0, 7).await.unwrap_err();
        assert_eq!(stale.kind, ErrorKind::CasConflict);

        let backwards = store.compare_and_swap_cursor("c1", "ds", 5, 2).await.unwrap_err();
        assert_eq!(backwards.kind, ErrorKind::Transaction);

        let moved = store.compare_and_swap_cursor("c1", "ds", 5, 9).await.unwrap();
        assert_eq!(moved.last_sequence_id, 9);
        assert_eq!(
            store.load_cursor("c1", "ds").await.unwrap().last_sequence_id,
            9
        );
    }

    #[tokio::test]
    async fn test_anomalies_filter_by_dataset() {
        let store = InMemoryLedgerStore::new();
        store
            .record_anomaly(&Anomaly::new(AnomalyKind::SchemaMismatch, "a", "bad row"))
            .await
            .unwrap();
        store
            .record_anomaly(&Anomaly::new(AnomalyKind::OrphanEvent, "b", "orphan"))
            .await
            .unwrap();

        assert_eq!(store.list_anomalies(None).await.unwrap().len(), 2);
        let only_b = store.list_anomalies(Some("b")).await.unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].kind, AnomalyKind::OrphanEvent);
    }
}
