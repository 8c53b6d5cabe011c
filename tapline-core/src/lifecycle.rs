//! App lifecycle notifications
//!
//! The host app forwards its platform callbacks into a [`LifecycleSignals`];
//! the coordinator subscribes once at start and reacts:
//!
//! - `Background` - flush immediately
//! - `Foreground` - pick up stored records and flush if online
//! - `Terminating` - persist the in-memory batch, no network

use tokio::sync::broadcast;

const SIGNAL_CAPACITY: usize = 16;

/// App lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Background,
    Foreground,
    Terminating,
}

/// Source of lifecycle notifications
pub trait LifecycleSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;
}

/// Broadcaster the host app fires lifecycle transitions into
#[derive(Clone)]
pub struct LifecycleSignals {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    /// Publish a transition to every subscriber
    pub fn emit(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(?event, "Lifecycle event with no subscribers");
        }
    }

    pub fn background(&self) {
        self.emit(LifecycleEvent::Background);
    }

    pub fn foreground(&self) {
        self.emit(LifecycleEvent::Foreground);
    }

    pub fn terminating(&self) {
        self.emit(LifecycleEvent::Terminating);
    }
}

impl Default for LifecycleSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSource for LifecycleSignals {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let signals = LifecycleSignals::new();
        let mut rx = signals.subscribe();

        signals.background();
        signals.terminating();

        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Background);
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Terminating);
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let signals = LifecycleSignals::new();
        signals.foreground();
    }
}
