//! # tapline-core
//!
//! Client-side event batching for behavioral analytics.
//!
//! This library provides:
//! - Record types for touch samples, device fingerprints and interactions
//! - A batch coordinator that flushes on size, time, lifecycle and
//!   connectivity triggers
//! - Durable local storage (SQLite) so nothing is lost across crashes or
//!   offline periods
//! - An HTTP delivery client for the collector API
//! - Configuration and logging infrastructure
//!
//! ## Guarantees
//!
//! Delivery is at-least-once: a record leaves the store only after the
//! collector accepted a batch containing it. A failed send never drops
//! records, and a batch of records already queued keeps its order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tapline_core::{BatchCoordinator, Config, HttpDeliveryClient, TouchAction, TouchSample};
//!
//! # async fn run() -> tapline_core::Result<()> {
//! let config = Config::load()?;
//! let client = Arc::new(HttpDeliveryClient::new(config.delivery.clone())?);
//!
//! let coordinator = BatchCoordinator::builder(client)
//!     .batching(&config.batching)
//!     .start()
//!     .await?;
//!
//! coordinator.add_event(TouchSample::new(TouchAction::Down, 120.0, 340.0).into_record());
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use connectivity::{ConnectivityObserver, HealthProbe, SharedConnectivity};
pub use coordinator::{BatchCoordinator, CoordinatorBuilder, CoordinatorStats};
pub use delivery::{DeliveryClient, HttpDeliveryClient};
pub use error::{DeliveryError, Error, Result, StoreError};
pub use lifecycle::{LifecycleEvent, LifecycleSignals, LifecycleSource};
pub use store::{EventStore, MemoryEventStore, SqliteEventStore};
pub use types::*;

// Public modules
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod store;
pub mod types;
