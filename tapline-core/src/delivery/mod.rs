//! Delivery to the remote collector
//!
//! A delivery is all-or-nothing from the caller's point of view: `send`
//! either returns `Ok` and every record counts as delivered, or it returns
//! an error and none do, even if the collector processed part of the batch.

mod http;

pub use http::HttpDeliveryClient;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::types::EventRecord;

/// Network boundary: one call per flushed batch
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Deliver a non-empty, ordered list of records as one unit
    async fn send(&self, records: &[EventRecord]) -> Result<(), DeliveryError>;

    /// Whether the collector currently answers
    async fn health_check(&self) -> bool {
        true
    }
}
