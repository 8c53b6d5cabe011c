//! Durable event store
//!
//! Records are persisted individually as they are added to a batch and
//! removed only after the collector confirmed their delivery. The store may
//! briefly hold a copy of a record that is also in memory; that overlap is
//! what makes crash recovery possible.
//!
//! - [`SqliteEventStore`] - on-disk store, survives process death
//! - [`MemoryEventStore`] - in-process store for tests and diskless hosts
//! - [`StoreWriter`] - the single ordered lane the coordinator talks through

mod memory;
pub mod schema;
mod sqlite;
mod writer;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;
pub use writer::StoreWriter;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{EventId, EventRecord};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence boundary for pending records.
///
/// Every operation is safe to retry. Operations on the same id must be
/// serialized by the implementation.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist one record, keyed by id
    async fn save(&self, record: &EventRecord) -> StoreResult<()> {
        self.save_all(std::slice::from_ref(record)).await
    }

    /// Persist several records; re-saving an existing id is harmless
    async fn save_all(&self, records: &[EventRecord]) -> StoreResult<()>;

    /// All persisted records, oldest first
    ///
    /// Rows that no longer decode into a record are skipped, not returned
    /// as an error, so they cannot hold back the rest of the backlog.
    async fn load_pending(&self) -> StoreResult<Vec<EventRecord>>;

    /// Delete records by id; unknown ids are ignored
    async fn remove(&self, ids: &[EventId]) -> StoreResult<()>;

    /// Number of persisted records
    async fn count(&self) -> StoreResult<usize> {
        Ok(self.load_pending().await?.len())
    }
}
