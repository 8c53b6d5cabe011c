//! Ordered persistence lane
//!
//! Every store operation the coordinator issues goes through one actor task
//! and is applied in submission order:
//!
//! ```text
//! add_event ──┐
//! flush ok  ──┤──► StoreWriter ──► EventStore (save / remove / load)
//! terminate ──┘
//! ```
//!
//! Because the save for a record is always submitted before the snapshot
//! containing it can be sent, the remove issued after a successful send is
//! always applied after that save. A late save can never resurrect a record
//! the collector already has.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{EventStore, StoreResult};
use crate::error::StoreError;
use crate::types::{EventId, EventRecord};

/// Messages for the persistence actor
enum StoreMessage {
    /// Persist records; the ack, if any, resolves once applied
    Save {
        records: Vec<EventRecord>,
        ack_tx: Option<oneshot::Sender<StoreResult<()>>>,
    },
    /// Delete delivered records
    Remove { ids: Vec<EventId> },
    /// Read everything, after all earlier writes
    Load {
        reply_tx: oneshot::Sender<StoreResult<Vec<EventRecord>>>,
    },
    /// Resolves once every earlier message has been applied
    Barrier { done_tx: oneshot::Sender<()> },
}

/// Handle for submitting work to the persistence actor
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreMessage>,
    failures: Arc<AtomicU64>,
}

impl StoreWriter {
    /// Spawn the actor on the given runtime
    ///
    /// The actor exits once every `StoreWriter` clone has been dropped and
    /// the queue is drained; await the returned handle to wait for that.
    pub fn spawn(
        store: Arc<dyn EventStore>,
        runtime: &tokio::runtime::Handle,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicU64::new(0));
        let actor = StoreActor {
            store,
            rx,
            failures: Arc::clone(&failures),
        };
        let handle = runtime.spawn(actor.run());
        (Self { tx, failures }, handle)
    }

    /// Queue records for persistence without waiting
    pub fn save(&self, records: Vec<EventRecord>) {
        if records.is_empty() {
            return;
        }
        if self
            .tx
            .send(StoreMessage::Save {
                records,
                ack_tx: None,
            })
            .is_err()
        {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Event store writer closed, record kept in memory only");
        }
    }

    /// Persist records and wait until they are applied
    pub async fn save_durable(&self, records: Vec<EventRecord>) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(StoreMessage::Save {
                records,
                ack_tx: Some(ack_tx),
            })
            .map_err(|_| StoreError::Closed)?;
        ack_rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Queue removal of delivered records
    pub fn remove(&self, ids: Vec<EventId>) {
        if ids.is_empty() {
            return;
        }
        if self.tx.send(StoreMessage::Remove { ids }).is_err() {
            tracing::warn!("Event store writer closed, delivered records not removed");
        }
    }

    /// Load all stored records as of every write submitted so far
    pub async fn load(&self) -> StoreResult<Vec<EventRecord>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StoreMessage::Load { reply_tx })
            .map_err(|_| StoreError::Closed)?;
        reply_rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Wait until every previously submitted operation has been applied
    pub async fn barrier(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(StoreMessage::Barrier { done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Number of store writes that failed so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Actor that owns the store side of the lane
struct StoreActor {
    store: Arc<dyn EventStore>,
    rx: mpsc::UnboundedReceiver<StoreMessage>,
    failures: Arc<AtomicU64>,
}

impl StoreActor {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                StoreMessage::Save { records, ack_tx } => {
                    let result = self.store.save_all(&records).await;
                    if let Err(e) = &result {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            error = %e,
                            count = records.len(),
                            "Failed to persist records, keeping them in memory"
                        );
                    }
                    if let Some(tx) = ack_tx {
                        let _ = tx.send(result);
                    }
                }
                StoreMessage::Remove { ids } => {
                    if let Err(e) = self.store.remove(&ids).await {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            error = %e,
                            count = ids.len(),
                            "Failed to remove delivered records; they may be sent again"
                        );
                    }
                }
                StoreMessage::Load { reply_tx } => {
                    let _ = reply_tx.send(self.store.load_pending().await);
                }
                StoreMessage::Barrier { done_tx } => {
                    let _ = done_tx.send(());
                }
            }
        }
        tracing::debug!("Event store writer stopped");
    }
}
