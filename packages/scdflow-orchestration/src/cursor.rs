use std::sync::Arc;

use scdflow_storage::{Cursor, LedgerStore};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};

/// Consumer cursors (persisted in the ledger store, advanced only by CAS)
#[derive(Clone)]
pub struct CursorManager {
    store: Arc<dyn LedgerStore>,
}

impl CursorManager {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, consumer_id: &str, dataset: &str) -> Result<Cursor> {
        Ok(self.store.load_cursor(consumer_id, dataset).await?)
    }

    /// Move `cursor` forward to `to`.
    ///
    /// A lost CAS surfaces as `MergeConflict`; the caller reloads and retries.
    pub async fn advance(&self, cursor: &Cursor, to: u64) -> Result<Cursor> {
        if to == cursor.last_sequence_id {
            return Ok(cursor.clone());
        }
        match self
            .store
            .compare_and_swap_cursor(&cursor.consumer_id, &cursor.dataset, cursor.last_sequence_id, to)
            .await
        {
            Ok(advanced) => {
                debug!(
                    consumer_id = %cursor.consumer_id,
                    dataset = %cursor.dataset,
                    from = cursor.last_sequence_id,
                    to,
                    "Cursor advanced"
                );
                Ok(advanced)
            }
            Err(e) if e.is_cas_conflict() => Err(OrchestratorError::MergeConflict {
                dataset: cursor.dataset.clone(),
                reason: e.message,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Position a fresh consumer at `at` (no-op if it is already there or beyond)
    pub async fn seed(&self, consumer_id: &str, dataset: &str, at: u64) -> Result<Cursor> {
        let cursor = self.load(consumer_id, dataset).await?;
        if cursor.last_sequence_id >= at {
            return Ok(cursor);
        }
        info!(consumer_id, dataset, at, "Seeding cursor");
        self.advance(&cursor, at).await
    }
}
