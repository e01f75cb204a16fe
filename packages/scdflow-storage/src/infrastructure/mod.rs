//! Infrastructure layer - LedgerStore adapters
//!
//! - `memory`: process-local store (tests, embedded use)
//! - `sqlite`: durable single-file store

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryLedgerStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedgerStore;
