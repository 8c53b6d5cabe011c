//! Batch coordinator
//!
//! Owns the in-memory batch and decides when it is flushed:
//!
//! - **Size**: the batch reaches `max_batch_size` inside `add_event`
//! - **Time**: `max_batch_time` after the first record of a batch
//! - **Lifecycle**: app goes to background (flush), comes to foreground
//!   (flush + drain store), or terminates (persist only)
//! - **Connectivity**: the collector becomes reachable (flush + drain store)
//!
//! ## State
//!
//! ```text
//! Idle ──add──► Accumulating ──trigger──► Flushing ──ok──► Idle
//!                    ▲                       │
//!                    └────────── failed ─────┘  (snapshot re-merged first)
//! ```
//!
//! While a snapshot is in flight a new batch may already be accumulating.
//! Batch, timer, in-flight registry and stats live behind one mutex that is
//! never held across an await.
//!
//! ## Persistence
//!
//! Each record is queued for the store as it is added, and removed only after
//! the collector accepted the batch containing it. Store traffic goes through
//! a single [`StoreWriter`] lane so a removal can never be overtaken by the
//! save of the same record.
//!
//! ## Duplicates
//!
//! Every record id in the batch or in flight is tracked. `add_event`,
//! startup reconciliation and store drains skip tracked ids, so one
//! coordinator never has two sends of the same record outstanding.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::{validate_batching, BatchingConfig, Config};
use crate::connectivity::{ConnectivityObserver, SharedConnectivity};
use crate::delivery::DeliveryClient;
use crate::error::{DeliveryError, Error, Result};
use crate::lifecycle::{LifecycleEvent, LifecycleSignals, LifecycleSource};
use crate::store::{EventStore, SqliteEventStore, StoreWriter};
use crate::types::{EventId, EventRecord};

/// Default records per batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

/// Default time from first record to timed flush
pub const DEFAULT_MAX_BATCH_TIME: Duration = Duration::from_secs(10);

/// Coordinator counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Records accepted by `add_event`
    pub events_added: u64,
    /// Records the collector confirmed
    pub events_sent: u64,
    /// Successful send calls
    pub batches_sent: u64,
    /// Failed send calls
    pub send_failures: u64,
    /// Failed store writes (records stayed in memory)
    pub persist_failures: u64,
}

/// Builder for [`BatchCoordinator`]; every collaborator can be overridden
pub struct CoordinatorBuilder {
    client: Arc<dyn DeliveryClient>,
    store: Option<Arc<dyn EventStore>>,
    connectivity: Option<Arc<dyn ConnectivityObserver>>,
    lifecycle: Option<Arc<dyn LifecycleSource>>,
    max_batch_size: usize,
    max_batch_time: Duration,
}

impl CoordinatorBuilder {
    fn new(client: Arc<dyn DeliveryClient>) -> Self {
        Self {
            client,
            store: None,
            connectivity: None,
            lifecycle: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_time: DEFAULT_MAX_BATCH_TIME,
        }
    }

    /// Event store (default: SQLite at [`Config::database_path`])
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reachability source (default: always online)
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityObserver>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Lifecycle source (default: one nobody fires)
    pub fn lifecycle(mut self, lifecycle: Arc<dyn LifecycleSource>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn max_batch_time(mut self, max_batch_time: Duration) -> Self {
        self.max_batch_time = max_batch_time;
        self
    }

    /// Take both thresholds from a config file section
    pub fn batching(self, config: &BatchingConfig) -> Self {
        self.max_batch_size(config.max_batch_size)
            .max_batch_time(config.max_batch_time())
    }

    /// Validate, wire up listeners and reconcile with the store.
    ///
    /// Must be called from within a tokio runtime. When this returns, every
    /// record the store held is in the batch or already on its way out.
    pub async fn start(self) -> Result<BatchCoordinator> {
        validate_batching(self.max_batch_size, self.max_batch_time)?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("coordinator requires a tokio runtime: {}", e)))?;

        let store: Arc<dyn EventStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteEventStore::open(&Config::database_path())?),
        };
        let connectivity: Arc<dyn ConnectivityObserver> = self
            .connectivity
            .unwrap_or_else(|| Arc::new(SharedConnectivity::online()));
        let lifecycle: Arc<dyn LifecycleSource> = self
            .lifecycle
            .unwrap_or_else(|| Arc::new(LifecycleSignals::new()));

        let (writer, _writer_task) = StoreWriter::spawn(store, &runtime);

        let inner = Arc::new(Inner {
            client: self.client,
            connectivity: Arc::clone(&connectivity),
            writer,
            runtime: runtime.clone(),
            max_batch_size: self.max_batch_size,
            max_batch_time: self.max_batch_time,
            state: Mutex::new(State::default()),
            reconcile: tokio::sync::Mutex::new(()),
        });

        let listeners = vec![
            runtime.spawn(listen_lifecycle(
                Arc::downgrade(&inner),
                lifecycle.subscribe(),
            )),
            runtime.spawn(listen_connectivity(
                Arc::downgrade(&inner),
                connectivity.changes(),
            )),
        ];

        tracing::info!(
            max_batch_size = inner.max_batch_size,
            max_batch_time_ms = inner.max_batch_time.as_millis() as u64,
            online = connectivity.is_available(),
            "Batch coordinator started"
        );

        if let Err(e) = inner.load_pending_events().await {
            tracing::warn!(error = %e, "Startup reconciliation failed, continuing with empty batch");
        }

        Ok(BatchCoordinator { inner, listeners })
    }
}

/// Accumulates records and ships them to the collector.
///
/// Dropping the coordinator stops its listeners and timer; records still
/// in memory are already in the store unless a save failed. Use
/// [`BatchCoordinator::shutdown`] to persist them explicitly first.
pub struct BatchCoordinator {
    inner: Arc<Inner>,
    listeners: Vec<JoinHandle<()>>,
}

impl BatchCoordinator {
    pub fn builder(client: Arc<dyn DeliveryClient>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(client)
    }

    /// Queue a record. Never blocks, never fails.
    ///
    /// Callable from any thread; work is spawned on the runtime the
    /// coordinator was started on.
    pub fn add_event(&self, record: EventRecord) {
        self.inner.add_event(record);
    }

    /// Send the current batch now and wait for the outcome.
    ///
    /// On failure the batch is restored (ahead of anything added meanwhile)
    /// and the error is returned. An empty batch is a successful no-op.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Send stored records this coordinator does not hold in memory
    ///
    /// Returns the number delivered. Stops at the first failed chunk and
    /// leaves the rest in the store.
    pub async fn drain_store(&self) -> Result<usize> {
        self.inner.drain_store().await
    }

    /// Merge stored records into the batch
    ///
    /// Runs automatically at start. Returns how many records were merged.
    pub async fn load_pending_events(&self) -> Result<usize> {
        self.inner.load_pending_events().await
    }

    /// Save the in-memory batch and wait until it is on disk
    pub async fn persist_pending(&self) -> Result<()> {
        self.inner.persist_pending().await
    }

    /// Wait until every store write issued so far has been applied
    pub async fn sync_store(&self) {
        self.inner.writer.barrier().await;
    }

    /// Records in the current batch, in send order
    pub fn pending_records(&self) -> Vec<EventRecord> {
        self.inner.lock().batch.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().batch.len()
    }

    /// Records handed to the delivery client and not yet resolved
    pub fn in_flight_len(&self) -> usize {
        let state = self.inner.lock();
        state.tracked.len().saturating_sub(state.batch.len())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = self.inner.lock().stats.clone();
        stats.persist_failures = self.inner.writer.failures();
        stats
    }

    /// Stop listening, persist the batch and wait for the store to settle
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop_listeners();
        self.inner.cancel_timer();
        let result = self.inner.persist_pending().await;
        self.inner.writer.barrier().await;
        tracing::info!(
            pending = self.pending_len(),
            "Batch coordinator shut down"
        );
        result
    }

    fn stop_listeners(&mut self) {
        for handle in self.listeners.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BatchCoordinator {
    fn drop(&mut self) {
        self.stop_listeners();
        self.inner.cancel_timer();
    }
}

/// Pending timed flush
struct FlushTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    batch: Vec<EventRecord>,
    /// Ids in `batch` or in flight
    tracked: HashSet<EventId>,
    timer: Option<FlushTimer>,
    timer_generation: u64,
    stats: CoordinatorStats,
}

struct Inner {
    client: Arc<dyn DeliveryClient>,
    connectivity: Arc<dyn ConnectivityObserver>,
    writer: StoreWriter,
    runtime: tokio::runtime::Handle,
    max_batch_size: usize,
    max_batch_time: Duration,
    state: Mutex<State>,
    /// Serializes store claims against each other
    reconcile: tokio::sync::Mutex<()>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_online(&self) -> bool {
        self.connectivity.is_available()
    }

    fn add_event(self: &Arc<Self>, record: EventRecord) {
        let snapshot = {
            let mut state = self.lock();
            if !state.tracked.insert(record.id) {
                tracing::debug!(id = %record.id, "Ignoring duplicate record");
                return;
            }
            state.stats.events_added += 1;
            state.batch.push(record.clone());
            // Queued under the lock so it precedes any removal of this record
            self.writer.save(vec![record]);

            if state.batch.len() >= self.max_batch_size && self.is_online() {
                Some(self.begin_flush(&mut state))
            } else {
                if state.timer.is_none() {
                    self.start_timer(&mut state);
                }
                None
            }
        };

        if let Some(snapshot) = snapshot {
            tracing::debug!(size = snapshot.len(), "Batch size reached, flushing");
            self.spawn_delivery(snapshot);
        }
    }

    async fn flush(self: &Arc<Self>) -> Result<()> {
        let snapshot = {
            let mut state = self.lock();
            if state.batch.is_empty() {
                return Ok(());
            }
            if !self.is_online() {
                return Err(DeliveryError::Offline.into());
            }
            self.begin_flush(&mut state)
        };

        self.deliver(snapshot).await.map_err(Error::from)
    }

    /// Freeze the batch for sending; new records start a fresh batch
    fn begin_flush(&self, state: &mut State) -> Vec<EventRecord> {
        Self::cancel_timer_locked(state);
        std::mem::take(&mut state.batch)
    }

    /// Send a snapshot and settle its records either way
    async fn deliver(
        self: &Arc<Self>,
        snapshot: Vec<EventRecord>,
    ) -> std::result::Result<(), DeliveryError> {
        match self.client.send(&snapshot).await {
            Ok(()) => {
                let ids: Vec<EventId> = snapshot.iter().map(|r| r.id).collect();
                let mut state = self.lock();
                for id in &ids {
                    state.tracked.remove(id);
                }
                state.stats.events_sent += ids.len() as u64;
                state.stats.batches_sent += 1;
                tracing::debug!(count = ids.len(), "Delivered batch");
                self.writer.remove(ids);
                Ok(())
            }
            Err(e) => {
                let mut state = self.lock();
                state.stats.send_failures += 1;
                let count = snapshot.len();
                // Snapshot first, then whatever arrived during the send
                let newer = std::mem::replace(&mut state.batch, snapshot);
                state.batch.extend(newer);
                if !state.batch.is_empty() {
                    self.start_timer(&mut state);
                }
                tracing::warn!(
                    error = %e,
                    count,
                    pending = state.batch.len(),
                    "Batch delivery failed, records restored"
                );
                Err(e)
            }
        }
    }

    fn spawn_delivery(self: &Arc<Self>, snapshot: Vec<EventRecord>) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            // Already logged and restored by deliver
            let _ = inner.deliver(snapshot).await;
        });
    }

    /// Flush without a waiting caller; errors only get logged
    fn spawn_flush(self: &Arc<Self>, reason: &'static str) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            match inner.flush().await {
                Ok(()) => {}
                Err(Error::Delivery(DeliveryError::Offline)) => {
                    tracing::debug!(reason, "Skipping flush while offline");
                }
                Err(e) => tracing::debug!(reason, error = %e, "Automatic flush failed"),
            }
        });
    }

    fn spawn_drain(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            match inner.drain_store().await {
                Ok(0) => {}
                Ok(sent) => tracing::info!(sent, "Drained stored records"),
                Err(e) => tracing::warn!(error = %e, "Store drain failed, will retry on reconnect"),
            }
        });
    }

    fn start_timer(self: &Arc<Self>, state: &mut State) {
        Self::cancel_timer_locked(state);

        state.timer_generation += 1;
        let generation = state.timer_generation;
        let deadline = tokio::time::Instant::now() + self.max_batch_time;
        let weak = Arc::downgrade(self);

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer(generation).await;
            }
        });

        state.timer = Some(FlushTimer { generation, handle });
    }

    fn cancel_timer(&self) {
        Self::cancel_timer_locked(&mut self.lock());
    }

    fn cancel_timer_locked(state: &mut State) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
    }

    async fn on_timer(self: &Arc<Self>, generation: u64) {
        let snapshot = {
            let mut state = self.lock();
            match &state.timer {
                Some(timer) if timer.generation == generation => {}
                // Replaced or cancelled while waking up
                _ => return,
            }
            // Clear before begin_flush so this task does not abort itself
            state.timer = None;

            if state.batch.is_empty() {
                return;
            }
            if !self.is_online() {
                tracing::debug!(
                    pending = state.batch.len(),
                    "Flush timer fired while offline, waiting for connectivity"
                );
                return;
            }
            self.begin_flush(&mut state)
        };

        tracing::debug!(size = snapshot.len(), "Flush timer fired");
        let _ = self.deliver(snapshot).await;
    }

    /// Load stored records and claim the ones this coordinator does not own
    async fn claim_stored(&self) -> Result<Vec<EventRecord>> {
        let _reconcile = self.reconcile.lock().await;
        // Owned records may be delivered and removed before the load replies
        let owned = self.lock().tracked.clone();
        let stored = self.writer.load().await?;

        let mut state = self.lock();
        Ok(stored
            .into_iter()
            .filter(|record| !owned.contains(&record.id) && state.tracked.insert(record.id))
            .collect())
    }

    async fn load_pending_events(self: &Arc<Self>) -> Result<usize> {
        let fresh = self.claim_stored().await?;
        let merged = fresh.len();

        let pending = {
            let mut state = self.lock();
            if merged > 0 {
                // Stored records predate anything added since start
                let newer = std::mem::replace(&mut state.batch, fresh);
                state.batch.extend(newer);
            }
            if !state.batch.is_empty() && state.timer.is_none() {
                self.start_timer(&mut state);
            }
            state.batch.len()
        };

        if merged > 0 {
            tracing::info!(merged, pending, "Recovered stored records");
        }
        if pending > 0 && self.is_online() {
            self.spawn_flush("reconcile");
        }

        Ok(merged)
    }

    async fn drain_store(self: &Arc<Self>) -> Result<usize> {
        if !self.is_online() {
            return Ok(0);
        }

        let orphans = self.claim_stored().await?;
        let mut sent = 0;
        let mut chunks = orphans.chunks(self.max_batch_size);

        while let Some(chunk) = chunks.next() {
            let ids: Vec<EventId> = chunk.iter().map(|r| r.id).collect();
            match self.client.send(chunk).await {
                Ok(()) => {
                    let mut state = self.lock();
                    for id in &ids {
                        state.tracked.remove(id);
                    }
                    state.stats.events_sent += ids.len() as u64;
                    state.stats.batches_sent += 1;
                    self.writer.remove(ids);
                    sent += chunk.len();
                }
                Err(e) => {
                    // Release the claim; the records stay in the store
                    let mut state = self.lock();
                    state.stats.send_failures += 1;
                    for record in chunk.iter().chain(chunks.by_ref().flatten()) {
                        state.tracked.remove(&record.id);
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(sent)
    }

    async fn persist_pending(&self) -> Result<()> {
        let records = self.lock().batch.clone();
        let count = records.len();
        self.writer.save_durable(records).await?;
        tracing::debug!(count, "Persisted in-memory batch");
        Ok(())
    }

    /// Collector may be reachable again: flush memory and drain the store
    fn on_available(self: &Arc<Self>, reason: &'static str) {
        if !self.is_online() {
            return;
        }
        self.spawn_flush(reason);
        self.spawn_drain();
    }

    async fn on_lifecycle(self: &Arc<Self>, event: LifecycleEvent) {
        tracing::debug!(?event, "Lifecycle event");
        match event {
            LifecycleEvent::Background => self.spawn_flush("background"),
            LifecycleEvent::Foreground => self.on_available("foreground"),
            LifecycleEvent::Terminating => {
                // No time for the network; make sure the batch is on disk
                if let Err(e) = self.persist_pending().await {
                    tracing::warn!(error = %e, "Failed to persist batch on termination");
                }
            }
        }
    }
}

async fn listen_lifecycle(inner: Weak<Inner>, mut rx: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match inner.upgrade() {
                Some(inner) => inner.on_lifecycle(event).await,
                None => break,
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("lifecycle listener lagged, missed {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn listen_connectivity(inner: Weak<Inner>, mut rx: watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        let available = *rx.borrow_and_update();
        if !available {
            continue;
        }
        match inner.upgrade() {
            Some(inner) => inner.on_available("connectivity"),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use crate::types::EventKind;
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl DeliveryClient for NullClient {
        async fn send(&self, _records: &[EventRecord]) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn builder() -> CoordinatorBuilder {
        BatchCoordinator::builder(Arc::new(NullClient)).store(Arc::new(MemoryEventStore::new()))
    }

    #[tokio::test]
    async fn test_rejects_zero_batch_size() {
        let result = builder().max_batch_size(0).start().await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_rejects_zero_batch_time() {
        let result = builder().max_batch_time(Duration::ZERO).start().await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_batching_config_applies() {
        let config = BatchingConfig {
            max_batch_size: 4,
            max_batch_time_secs: 2,
        };
        let coordinator = builder().batching(&config).start().await.unwrap();
        assert_eq!(coordinator.inner.max_batch_size, 4);
        assert_eq!(coordinator.inner.max_batch_time, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_record_arms_single_timer() {
        let coordinator = builder().start().await.unwrap();

        coordinator.add_event(EventRecord::new(EventKind::Touch, serde_json::json!({})));
        let first = coordinator.inner.lock().timer_generation;
        coordinator.add_event(EventRecord::new(EventKind::Touch, serde_json::json!({})));
        let second = coordinator.inner.lock().timer_generation;

        assert_eq!(first, second);
        assert!(coordinator.inner.lock().timer.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_generation_is_ignored() {
        let coordinator = builder().start().await.unwrap();
        coordinator.add_event(EventRecord::new(EventKind::Touch, serde_json::json!({})));
        let current = coordinator.inner.lock().timer_generation;

        coordinator.inner.on_timer(current + 41).await;

        assert_eq!(coordinator.pending_len(), 1);
        assert!(coordinator.inner.lock().timer.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_tracked_once() {
        let coordinator = builder().start().await.unwrap();
        let record = EventRecord::new(EventKind::Touch, serde_json::json!({}));

        coordinator.add_event(record.clone());
        coordinator.add_event(record);

        assert_eq!(coordinator.pending_len(), 1);
        assert_eq!(coordinator.stats().events_added, 1);
    }
}
