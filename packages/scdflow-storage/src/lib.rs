//! scdflow-storage - durable change ledger and shared data model
//!
//! > "Every change is written once, read in order, and consumed exactly once per consumer."
//!
//! ## Core Principles
//!
//! 1. **Append-only ledger**: change events are sequenced per dataset and never rewritten
//! 2. **Consumer cursors**: read positions move forward only, via compare-and-swap
//! 3. **Nothing dropped**: rows that cannot be applied are persisted as anomalies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scdflow_storage::{InMemoryLedgerStore, LedgerStore};
//!
//! let store = InMemoryLedgerStore::new();
//! let events = store.append_events("customers", new_events).await?;
//! let cursor = store.load_cursor("merge_dimension:customers", "customers").await?;
//! let slice = store.read_events("customers", cursor.last_sequence_id, None, 500).await?;
//! store
//!     .compare_and_swap_cursor("merge_dimension:customers", "customers", 0, slice.len() as u64)
//!     .await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    AggregateRow, Anomaly, AnomalyKind, ChangeAction, ChangeEvent, Cursor, FactRow, Granularity,
    LedgerStore, NaturalKey, NewChangeEvent, Period, Row, SourceRow, VersionedEntity,
};
pub use infrastructure::InMemoryLedgerStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteLedgerStore;
