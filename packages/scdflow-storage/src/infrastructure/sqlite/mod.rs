//! SQLite adapter for LedgerStore
//!
//! Schema:
//! - `change_events`: append-only, primary key `(dataset, sequence_id)`
//! - `dataset_sequences`: last assigned sequence id per dataset
//! - `consumer_cursors`: one row per `(consumer_id, dataset)`
//! - `anomalies`: rejected and orphaned data with its reason
//!
//! Keys, payloads and anomaly details are stored as JSON text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{
    Anomaly, AnomalyKind, ChangeAction, ChangeEvent, Cursor, LedgerStore, NaturalKey,
    NewChangeEvent, Row,
};
use crate::{Result, StorageError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_events (
    dataset      TEXT    NOT NULL,
    sequence_id  INTEGER NOT NULL,
    natural_key  TEXT    NOT NULL,
    action       TEXT    NOT NULL,
    payload      TEXT    NOT NULL,
    captured_at  TEXT    NOT NULL,
    PRIMARY KEY (dataset, sequence_id)
);

CREATE TABLE IF NOT EXISTS dataset_sequences (
    dataset           TEXT    PRIMARY KEY,
    last_sequence_id  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS consumer_cursors (
    consumer_id       TEXT    NOT NULL,
    dataset           TEXT    NOT NULL,
    last_sequence_id  INTEGER NOT NULL,
    updated_at        TEXT    NOT NULL,
    PRIMARY KEY (consumer_id, dataset)
);

CREATE TABLE IF NOT EXISTS anomalies (
    id           TEXT    PRIMARY KEY,
    kind         TEXT    NOT NULL,
    dataset      TEXT    NOT NULL,
    sequence_id  INTEGER,
    natural_key  TEXT,
    reason       TEXT    NOT NULL,
    details      TEXT    NOT NULL,
    detected_at  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_anomalies_dataset ON anomalies (dataset);
"#;

/// SQLite-backed ledger store
///
/// One connection guarded by a mutex; every method runs its statements inside
/// a single transaction so sequence assignment and cursor CAS are atomic.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open (or create) a ledger database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn to_sql_seq(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::database(format!("sequence id {} out of range", value)))
}

fn from_sql_seq(value: i64) -> u64 {
    value.max(0) as u64
}

struct EventRow {
    sequence_id: i64,
    dataset: String,
    natural_key: String,
    action: String,
    payload: String,
    captured_at: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Result<ChangeEvent> {
        let key: NaturalKey = serde_json::from_str(&self.natural_key)?;
        let payload: Row = serde_json::from_str(&self.payload)?;
        Ok(ChangeEvent {
            sequence_id: from_sql_seq(self.sequence_id),
            dataset: self.dataset,
            key,
            action: ChangeAction::parse(&self.action)?,
            payload,
            captured_at: self.captured_at,
        })
    }
}

struct AnomalyRow {
    id: String,
    kind: String,
    dataset: String,
    sequence_id: Option<i64>,
    natural_key: Option<String>,
    reason: String,
    details: String,
    detected_at: DateTime<Utc>,
}

impl AnomalyRow {
    fn into_anomaly(self) -> Result<Anomaly> {
        let id = uuid::Uuid::parse_str(&self.id)
            .map_err(|e| StorageError::serialization(format!("Invalid anomaly id: {}", e)))?;
        let natural_key = match self.natural_key {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(Anomaly {
            id,
            kind: AnomalyKind::parse(&self.kind)?,
            dataset: self.dataset,
            sequence_id: self.sequence_id.map(from_sql_seq),
            natural_key,
            reason: self.reason,
            details: serde_json::from_str(&self.details)?,
            detected_at: self.detected_at,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn append_events(
        &self,
        dataset: &str,
        events: Vec<NewChangeEvent>,
    ) -> Result<Vec<ChangeEvent>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let last: Option<i64> = tx
            .query_row(
                "SELECT last_sequence_id FROM dataset_sequences WHERE dataset = ?1",
                params![dataset],
                |row| row.get(0),
            )
            .optional()?;
        let mut next = last.map_or(0, from_sql_seq);

        let mut appended = Vec::with_capacity(events.len());
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO change_events
                    (dataset, sequence_id, natural_key, action, payload, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for event in events {
                next += 1;
                let sequenced = ChangeEvent::from_new(dataset, next, event);
                insert.execute(params![
                    dataset,
                    to_sql_seq(next)?,
                    serde_json::to_string(&sequenced.key)?,
                    sequenced.action.as_str(),
                    serde_json::to_string(&sequenced.payload)?,
                    sequenced.captured_at,
                ])?;
                appended.push(sequenced);
            }
        }

        tx.execute(
            "INSERT INTO dataset_sequences (dataset, last_sequence_id) VALUES (?1, ?2)
             ON CONFLICT(dataset) DO UPDATE SET last_sequence_id = excluded.last_sequence_id",
            params![dataset, to_sql_seq(next)?],
        )?;
        tx.commit()?;

        Ok(appended)
    }

    async fn read_events(
        &self,
        dataset: &str,
        after: u64,
        until: Option<u64>,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT sequence_id, dataset, natural_key, action, payload, captured_at
             FROM change_events
             WHERE dataset = ?1 AND sequence_id > ?2 AND sequence_id <= ?3
             ORDER BY sequence_id
             LIMIT ?4",
        )?;

        let upper = match until {
            Some(u) => to_sql_seq(u)?,
            None => i64::MAX,
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = stmt.query_map(params![dataset, to_sql_seq(after)?, upper, limit], |row| {
            Ok(EventRow {
                sequence_id: row.get(0)?,
                dataset: row.get(1)?,
                natural_key: row.get(2)?,
                action: row.get(3)?,
                payload: row.get(4)?,
                captured_at: row.get(5)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }

    async fn head_sequence(&self, dataset: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let last: Option<i64> = conn
            .query_row(
                "SELECT last_sequence_id FROM dataset_sequences WHERE dataset = ?1",
                params![dataset],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.map_or(0, from_sql_seq))
    }

    async fn load_cursor(&self, consumer_id: &str, dataset: &str) -> Result<Cursor> {
        let conn = self.conn.lock();
        let found: Option<(i64, DateTime<Utc>)> = conn
            .query_row(
                "SELECT last_sequence_id, updated_at FROM consumer_cursors
                 WHERE consumer_id = ?1 AND dataset = ?2",
                params![consumer_id, dataset],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(match found {
            Some((last, updated_at)) => Cursor {
                consumer_id: consumer_id.to_string(),
                dataset: dataset.to_string(),
                last_sequence_id: from_sql_seq(last),
                updated_at,
            },
            None => Cursor::initial(consumer_id, dataset),
        })
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

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let mut swapped = tx.execute(
            "UPDATE consumer_cursors SET last_sequence_id = ?1, updated_at = ?2
             WHERE consumer_id = ?3 AND dataset = ?4 AND last_sequence_id = ?5",
            params![
                to_sql_seq(new)?,
                now,
                consumer_id,
                dataset,
                to_sql_seq(expected)?
            ],
        )?;

        if swapped == 0 && expected == 0 {
            swapped = tx.execute(
                "INSERT OR IGNORE INTO consumer_cursors
                    (consumer_id, dataset, last_sequence_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![consumer_id, dataset, to_sql_seq(new)?, now],
            )?;
        }

        if swapped == 0 {
            let actual: Option<i64> = tx
                .query_row(
                    "SELECT last_sequence_id FROM consumer_cursors
                     WHERE consumer_id = ?1 AND dataset = ?2",
                    params![consumer_id, dataset],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(StorageError::cas_conflict(
                consumer_id,
                dataset,
                expected,
                actual.map_or(0, from_sql_seq),
            ));
        }

        tx.commit()?;
        Ok(Cursor {
            consumer_id: consumer_id.to_string(),
            dataset: dataset.to_string(),
            last_sequence_id: new,
            updated_at: now,
        })
    }

    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        let conn = self.conn.lock();
        let natural_key = match &anomaly.natural_key {
            Some(key) => Some(serde_json::to_string(key)?),
            None => None,
        };
        let sequence_id = match anomaly.sequence_id {
            Some(seq) => Some(to_sql_seq(seq)?),
            None => None,
        };

        conn.execute(
            "INSERT INTO anomalies
                (id, kind, dataset, sequence_id, natural_key, reason, details, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                anomaly.id.to_string(),
                anomaly.kind.as_str(),
                anomaly.dataset,
                sequence_id,
                natural_key,
                anomaly.reason,
                serde_json::to_string(&anomaly.details)?,
                anomaly.detected_at,
            ],
        )?;
        Ok(())
    }

    async fn list_anomalies(&self, dataset: Option<&str>) -> Result<Vec<Anomaly>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, kind, dataset, sequence_id, natural_key, reason, details, detected_at
             FROM anomalies
             WHERE ?1 IS NULL OR dataset = ?1
             ORDER BY detected_at, rowid",
        )?;

        let rows = stmt.query_map(params![dataset], |row| {
            Ok(AnomalyRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                dataset: row.get(2)?,
                sequence_id: row.get(3)?,
                natural_key: row.get(4)?,
                reason: row.get(5)?,
                details: row.get(6)?,
                detected_at: row.get(7)?,
            })
        })?;

        let mut anomalies = Vec::new();
        for row in rows {
            anomalies.push(row?.into_anomaly()?);
        }
        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    fn new_event(id: u32, action: ChangeAction) -> NewChangeEvent {
        let mut payload = Row::new();
        payload.insert("id".to_string(), json!(id));
        payload.insert("name".to_string(), json!(format!("name-{}", id)));
        NewChangeEvent {
            key: NaturalKey::single("id", id.to_string()),
            action,
            payload,
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_roundtrip() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();

        let appended = store
            .append_events(
                "customers",
                vec![
                    new_event(1, ChangeAction::Insert),
                    new_event(1, ChangeAction::Update),
                ],
            )
            .await
            .unwrap();
        assert_eq!(appended[1].sequence_id, 2);

        let read = store.read_events("customers", 0, None, 10).await.unwrap();
        assert_eq!(read, appended);
        assert_eq!(store.head_sequence("customers").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_events_limit_and_upper_bound() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        store
            .append_events(
                "ds",
                (1..=6).map(|i| new_event(i, ChangeAction::Insert)).collect(),
            )
            .await
            .unwrap();

        let limited = store.read_events("ds", 1, None, 2).await.unwrap();
        assert_eq!(
            limited.iter().map(|e| e.sequence_id).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let bounded = store.read_events("ds", 0, Some(4), 100).await.unwrap();
        assert_eq!(bounded.len(), 4);
    }

    #[tokio::test]
    async fn test_cursor_cas_conflict() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();

        store.compare_and_swap_cursor("w", "ds", 0, 3).await.unwrap();
        let err = store
            .compare_and_swap_cursor("w", "ds", 0, 4)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CasConflict);
        assert!(err.message.contains("found 3"));

        store.compare_and_swap_cursor("w", "ds", 3, 3).await.unwrap();
        assert_eq!(
            store.load_cursor("w", "ds").await.unwrap().last_sequence_id,
            3
        );
    }

    #[tokio::test]
    async fn test_anomaly_roundtrip() {
        let store = SqliteLedgerStore::open_in_memory().unwrap();
        let event = store
            .append_events("ds", vec![new_event(9, ChangeAction::Update)])
            .await
            .unwrap()
            .remove(0);

        let anomaly =
            Anomaly::new(AnomalyKind::OrphanEvent, "ds", "no current row").with_event(&event);
        store.record_anomaly(&anomaly).await.unwrap();
        store
            .record_anomaly(&Anomaly::new(AnomalyKind::SchemaMismatch, "other", "bad"))
            .await
            .unwrap();

        let listed = store.list_anomalies(Some("ds")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, anomaly.id);
        assert_eq!(listed[0].natural_key, Some(NaturalKey::single("id", "9")));
        assert_eq!(listed[0].sequence_id, Some(1));
        assert_eq!(store.list_anomalies(None).await.unwrap().len(), 2);
    }
}
