//! Anomaly/alert channel
//!
//! Every skipped row, surfaced orphan and rejected batch becomes an [`Anomaly`].
//! [`AnomalyReporter`] persists it in the ledger store first and only then hands
//! it to the configured [`AnomalySink`], so an alert is never emitted for a
//! record that was not written.

use std::sync::Arc;

use parking_lot::Mutex;
use scdflow_storage::{Anomaly, AnomalyKind, LedgerStore};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;

/// Receiver of structured anomaly records
///
/// Implementations must not block; buffer internally if delivery is slow.
pub trait AnomalySink: Send + Sync {
    fn emit(&self, anomaly: &Anomaly);
}

/// Default sink: one `warn` line per anomaly on the `anomaly` target
#[derive(Debug, Default, Clone)]
pub struct TracingAnomalySink;

impl AnomalySink for TracingAnomalySink {
    fn emit(&self, anomaly: &Anomaly) {
        warn!(
            target: "anomaly",
            anomaly_id = %anomaly.id,
            kind = %anomaly.kind,
            dataset = %anomaly.dataset,
            sequence_id = ?anomaly.sequence_id,
            natural_key = ?anomaly.natural_key.as_ref().map(|k| k.to_string()),
            reason = %anomaly.reason,
            "data_anomaly"
        );
    }
}

/// Forwards anomalies to an async consumer
#[derive(Debug, Clone)]
pub struct ChannelAnomalySink {
    tx: mpsc::UnboundedSender<Anomaly>,
}

impl ChannelAnomalySink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Anomaly>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AnomalySink for ChannelAnomalySink {
    fn emit(&self, anomaly: &Anomaly) {
        if self.tx.send(anomaly.clone()).is_err() {
            // Receiver gone; the record is already persisted
            warn!(anomaly_id = %anomaly.id, "Anomaly channel closed, alert not delivered");
        }
    }
}

/// Captures anomalies in memory for assertions
#[derive(Debug, Default)]
pub struct MemoryAnomalySink {
    records: Mutex<Vec<Anomaly>>,
}

impl MemoryAnomalySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Anomaly> {
        self.records.lock().clone()
    }

    pub fn of_kind(&self, kind: AnomalyKind) -> Vec<Anomaly> {
        self.records
            .lock()
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AnomalySink for MemoryAnomalySink {
    fn emit(&self, anomaly: &Anomaly) {
        self.records.lock().push(anomaly.clone());
    }
}

/// Persist-then-emit
#[derive(Clone)]
pub struct AnomalyReporter {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn AnomalySink>,
}

impl AnomalyReporter {
    pub fn new(store: Arc<dyn LedgerStore>, sink: Arc<dyn AnomalySink>) -> Self {
        Self { store, sink }
    }

    pub async fn report(&self, anomaly: &Anomaly) -> Result<()> {
        self.store.record_anomaly(anomaly).await?;
        self.sink.emit(anomaly);
        #[cfg(feature = "metrics")]
        crate::metrics::record_anomaly(anomaly.kind.as_str());
        Ok(())
    }

    pub async fn report_all(&self, anomalies: &[Anomaly]) -> Result<()> {
        for anomaly in anomalies {
            self.report(anomaly).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scdflow_storage::InMemoryLedgerStore;

    #[tokio::test]
    async fn test_reporter_persists_then_emits() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let sink = Arc::new(MemoryAnomalySink::new());
        let reporter = AnomalyReporter::new(store.clone(), sink.clone());

        reporter
            .report(&Anomaly::new(
                AnomalyKind::OrphanEvent,
                "customers",
                "no current row for id=9",
            ))
            .await
            .unwrap();

        assert_eq!(store.list_anomalies(None).await.unwrap().len(), 1);
        assert_eq!(sink.of_kind(AnomalyKind::OrphanEvent).len(), 1);
        assert!(sink.of_kind(AnomalyKind::SchemaMismatch).is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelAnomalySink::channel();
        let anomaly = Anomaly::new(AnomalyKind::SchemaMismatch, "orders", "missing key");
        sink.emit(&anomaly);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, anomaly.id);
    }

    #[test]
    fn test_channel_sink_tolerates_closed_receiver() {
        let (sink, rx) = ChannelAnomalySink::channel();
        drop(rx);
        sink.emit(&Anomaly::new(AnomalyKind::SchemaMismatch, "orders", "x"));
    }
}
