//! SQLite-backed event store

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::schema;
use super::{EventStore, StoreResult};
use crate::error::StoreError;
use crate::types::{EventId, EventKind, EventRecord};

/// Event store on a single SQLite connection.
///
/// The connection sits behind a mutex, so every operation (and therefore
/// every operation on the same id) is serialized. Blocking SQLite calls run
/// on the tokio blocking pool.
#[derive(Clone)]
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteEventStore {
    /// Open or create a store at the given path and run migrations
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL keeps readers off the writer's lock; a committed transaction
        // survives process death.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        schema::run_migrations(&conn)?;

        tracing::debug!(path = %path.display(), "Opened event store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// File backing this store, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Column values for one record
struct StoredRow {
    id: String,
    recorded_at: i64,
    kind: String,
    payload: String,
}

impl StoredRow {
    fn from_record(record: &EventRecord) -> StoreResult<Self> {
        Ok(Self {
            id: record.id.to_string(),
            recorded_at: record.recorded_at.timestamp_micros(),
            kind: record.kind.as_str().to_string(),
            payload: serde_json::to_string(&record.payload)?,
        })
    }

    fn into_record(self) -> StoreResult<EventRecord> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };

        let id: EventId = self.id.parse().map_err(corrupt)?;
        let recorded_at: DateTime<Utc> = DateTime::from_timestamp_micros(self.recorded_at)
            .ok_or_else(|| corrupt(format!("timestamp out of range: {}", self.recorded_at)))?;
        let kind: EventKind = self.kind.parse().map_err(corrupt)?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("invalid payload: {}", e)))?;

        Ok(EventRecord {
            id,
            recorded_at,
            kind,
            payload,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn save_all(&self, records: &[EventRecord]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let rows = records
            .iter()
            .map(StoredRow::from_record)
            .collect::<StoreResult<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let stored_at = Utc::now().to_rfc3339();

            for row in &rows {
                tx.execute(
                    r#"
                    INSERT INTO pending_events (id, recorded_at, kind, payload, stored_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        recorded_at = excluded.recorded_at,
                        kind = excluded.kind,
                        payload = excluded.payload
                    "#,
                    params![row.id, row.recorded_at, row.kind, row.payload, stored_at],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_pending(&self) -> StoreResult<Vec<EventRecord>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, recorded_at, kind, payload
                    FROM pending_events
                    ORDER BY recorded_at ASC, rowid ASC
                    "#,
                )?;

                let rows = stmt
                    .query_map([], |row| {
                        Ok(StoredRow {
                            id: row.get(0)?,
                            recorded_at: row.get(1)?,
                            kind: row.get(2)?,
                            payload: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(rows)
            })
            .await?;

        // One undecodable row must not hold back the rest of the backlog
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable stored record");
                    None
                }
            })
            .collect())
    }

    async fn remove(&self, ids: &[EventId]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM pending_events WHERE id = ?1")?;
                for id in &ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM pending_events", [], |r| r.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record_at(offset_secs: i64) -> EventRecord {
        EventRecord::new(EventKind::Touch, serde_json::json!({"x": offset_secs}))
            .with_recorded_at(Utc::now() + Duration::seconds(offset_secs))
    }

    #[tokio::test]
    async fn test_save_and_load_ordered_by_time() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let late = record_at(10);
        let early = record_at(-10);
        let middle = record_at(0);

        store.save(&late).await.unwrap();
        store.save_all(&[early.clone(), middle.clone()]).await.unwrap();

        let loaded = store.load_pending().await.unwrap();
        let ids: Vec<EventId> = loaded.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, middle.id, late.id]);
        assert_eq!(loaded[0].payload, early.payload);
        assert_eq!(loaded[0].kind, EventKind::Touch);
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let record = record_at(0);

        store.save(&record).await.unwrap();
        store.save(&record).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_ignores_unknown_ids() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let kept = record_at(0);
        let removed = record_at(1);
        store.save_all(&[kept.clone(), removed.clone()]).await.unwrap();

        store.remove(&[removed.id, EventId::new()]).await.unwrap();

        let loaded = store.load_pending().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, kept.id);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.db");
        let record = record_at(0);

        {
            let store = SqliteEventStore::open(&path).unwrap();
            store.save(&record).await.unwrap();
        }

        let reopened = SqliteEventStore::open(&path).unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        let loaded = reopened.load_pending().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, record.id);
        assert_eq!(
            loaded[0].recorded_at.timestamp_micros(),
            record.recorded_at.timestamp_micros()
        );
    }

    async fn insert_raw(store: &SqliteEventStore, id: &str, kind: &str, payload: &str) {
        let (id, kind, payload) = (id.to_string(), kind.to_string(), payload.to_string());
        store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO pending_events (id, recorded_at, kind, payload, stored_at)
                     VALUES (?1, 0, ?2, ?3, '')",
                    params![id, kind, payload],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let row = StoredRow {
            id: "bogus".to_string(),
            recorded_at: 0,
            kind: "touch".to_string(),
            payload: "{}".to_string(),
        };
        let err = row.into_record().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref id, .. } if id == "bogus"));
    }

    #[tokio::test]
    async fn test_corrupt_rows_do_not_block_valid_records() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let good = record_at(0);
        store.save(&good).await.unwrap();
        insert_raw(&store, "not-a-uuid", "touch", "{}").await;
        insert_raw(&store, &EventId::new().to_string(), "gesture", "{}").await;
        insert_raw(&store, &EventId::new().to_string(), "touch", "{not json").await;

        let loaded = store.load_pending().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, good.id);
        assert_eq!(store.count().await.unwrap(), 4);
    }
}
