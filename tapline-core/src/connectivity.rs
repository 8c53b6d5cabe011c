//! Reachability of the collector
//!
//! The coordinator asks [`ConnectivityObserver::is_available`] before every
//! automatic flush and listens on [`ConnectivityObserver::changes`] to
//! retry when the network comes back. Notifications may repeat or arrive
//! late; the coordinator reacts idempotently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::delivery::DeliveryClient;

/// Environment boundary for network reachability
pub trait ConnectivityObserver: Send + Sync {
    /// Current reachability; must not block
    fn is_available(&self) -> bool;

    /// Fresh subscription to reachability transitions.
    ///
    /// Each call returns an independent receiver that yields for every
    /// change after the call; it never closes while the observer lives.
    fn changes(&self) -> watch::Receiver<bool>;
}

/// Push-based observer the host app updates from platform callbacks
#[derive(Clone)]
pub struct SharedConnectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl SharedConnectivity {
    pub fn new(available: bool) -> Self {
        let (tx, _rx) = watch::channel(available);
        Self { tx: Arc::new(tx) }
    }

    /// Observer that starts out reachable
    pub fn online() -> Self {
        Self::new(true)
    }

    /// Observer that starts out unreachable
    pub fn offline() -> Self {
        Self::new(false)
    }

    /// Report reachability; repeating the current value notifies nobody
    pub fn set_available(&self, available: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == available {
                false
            } else {
                *current = available;
                true
            }
        });
        if changed {
            tracing::info!(available, "Connectivity changed");
        }
    }
}

impl Default for SharedConnectivity {
    fn default() -> Self {
        Self::online()
    }
}

impl ConnectivityObserver for SharedConnectivity {
    fn is_available(&self) -> bool {
        *self.tx.borrow()
    }

    fn changes(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Polls the collector's health endpoint and feeds a [`SharedConnectivity`]
///
/// For hosts without a platform reachability callback. The probe stops when
/// dropped.
pub struct HealthProbe {
    handle: JoinHandle<()>,
}

impl HealthProbe {
    pub fn spawn(
        client: Arc<dyn DeliveryClient>,
        connectivity: SharedConnectivity,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let healthy = client.health_check().await;
                tracing::trace!(healthy, "Health probe");
                connectivity.set_available(healthy);
            }
        });
        Self { handle }
    }
}

impl Drop for HealthProbe {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
