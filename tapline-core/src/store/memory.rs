//! In-process event store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{EventStore, StoreResult};
use crate::error::StoreError;
use crate::types::{EventId, EventRecord};

/// Event store held in memory.
///
/// Nothing survives the process, so this is for tests and for hosts that
/// cannot write to disk. `set_failing(true)` makes every operation fail with
/// an IO error, which is how tests exercise the swallowed-persist path.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

#[derive(Default)]
struct Inner {
    /// Record plus insertion rank, the tie-breaker for equal timestamps
    records: HashMap<EventId, (u64, EventRecord)>,
    next_seq: u64,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate, as if a previous process had saved these
    pub fn with_records(records: impl IntoIterator<Item = EventRecord>) -> Self {
        let mut inner = Inner::default();
        for record in records {
            inner.records.insert(record.id, (inner.next_seq, record));
            inner.next_seq += 1;
        }
        Self {
            inner: Mutex::new(inner),
            failing: AtomicBool::new(false),
        }
    }

    /// Toggle simulated storage failure
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether a record with this id is currently stored
    pub async fn contains(&self, id: &EventId) -> bool {
        self.inner.lock().await.records.contains_key(id)
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated storage failure",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn save_all(&self, records: &[EventRecord]) -> StoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        for record in records {
            // Keep the original insertion rank on overwrite
            let existing = inner.records.get(&record.id).map(|(seq, _)| *seq);
            let seq = match existing {
                Some(seq) => seq,
                None => {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    seq
                }
            };
            inner.records.insert(record.id, (seq, record.clone()));
        }
        Ok(())
    }

    async fn load_pending(&self) -> StoreResult<Vec<EventRecord>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let mut entries: Vec<&(u64, EventRecord)> = inner.records.values().collect();
        entries.sort_by_key(|(seq, record)| (record.recorded_at, *seq));
        Ok(entries.into_iter().map(|(_, record)| record.clone()).collect())
    }

    async fn remove(&self, ids: &[EventId]) -> StoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        for id in ids {
            inner.records.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> StoreResult<usize> {
        self.check()?;
        Ok(self.inner.lock().await.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    fn record() -> EventRecord {
        EventRecord::new(EventKind::Touch, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_round_trip_and_remove() {
        let store = MemoryEventStore::new();
        let a = record();
        let b = record();

        store.save_all(&[a.clone(), b.clone()]).await.unwrap();
        store.save(&a).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        store.remove(&[a.id]).await.unwrap();
        assert!(!store.contains(&a.id).await);
        assert!(store.contains(&b.id).await);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_insertion_order() {
        let now = chrono::Utc::now();
        let first = record().with_recorded_at(now);
        let second = record().with_recorded_at(now);
        let store = MemoryEventStore::with_records([first.clone(), second.clone()]);

        let loaded = store.load_pending().await.unwrap();
        assert_eq!(loaded[0].id, first.id);
        assert_eq!(loaded[1].id, second.id);
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryEventStore::new();
        store.set_failing(true);
        assert!(store.save(&record()).await.is_err());
        assert!(store.load_pending().await.is_err());

        store.set_failing(false);
        assert!(store.save(&record()).await.is_ok());
    }
}
