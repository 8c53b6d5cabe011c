//! Core domain types for tapline
//!
//! An [`EventRecord`] is the unit everything else moves around: the
//! coordinator batches them, the store persists them, the delivery client
//! ships them. The coordinator only looks at the identity and timestamp;
//! the payload is opaque to it.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Record** | One captured interaction or measurement, immutable once created |
//! | **Batch** | Records accumulated since the last successful flush |
//! | **Snapshot** | The frozen copy of a batch handed to the delivery client |
//! | **LID** | Opaque device/session identity assigned by the collector |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================
// Identity
// ============================================

/// Globally unique record identity.
///
/// Used as the storage key and for de-duplication across persist/reload
/// cycles, so it must stay stable for the lifetime of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for EventId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("invalid event id {}: {}", s, e))
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================
// Records
// ============================================

/// What produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Device fingerprint snapshot
    Fingerprint,
    /// Raw touch sample
    Touch,
    /// Higher-level interaction (tap, scroll, key)
    Interaction,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Fingerprint => "fingerprint",
            EventKind::Touch => "touch",
            EventKind::Interaction => "interaction",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fingerprint" => Ok(EventKind::Fingerprint),
            "touch" => Ok(EventKind::Touch),
            "interaction" => Ok(EventKind::Interaction),
            _ => Err(format!("unknown event kind: {}", s)),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured event, as batched, persisted and delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Stable identity, generated at creation
    pub id: EventId,
    /// Wall-clock capture time; only used to order reloads
    pub recorded_at: DateTime<Utc>,
    /// Producer category
    pub kind: EventKind,
    /// Producer-defined measurement attributes
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Create a record with a fresh id, stamped now
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            recorded_at: Utc::now(),
            kind,
            payload,
        }
    }

    /// Override the capture time (reloads, replays)
    pub fn with_recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}

// ============================================
// Producers
// ============================================

/// Phase of a touch gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchAction {
    Down,
    Move,
    Up,
    Cancel,
}

impl std::str::FromStr for TouchAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "down" => Ok(TouchAction::Down),
            "move" => Ok(TouchAction::Move),
            "up" => Ok(TouchAction::Up),
            "cancel" => Ok(TouchAction::Cancel),
            _ => Err(format!("unknown touch action: {}", s)),
        }
    }
}

/// A single touch measurement reported by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchSample {
    pub action: TouchAction,
    /// Platform pointer index (multi-touch)
    pub pointer_id: u32,
    /// Screen coordinates in pixels
    pub x: f32,
    pub y: f32,
    /// Normalized pressure, 0.0..=1.0 on most devices
    pub pressure: f32,
    /// Normalized contact area
    pub size: f32,
    /// Pixels per second
    pub velocity_x: f32,
    pub velocity_y: f32,
}

impl TouchSample {
    /// Primary-pointer sample at a position; other fields zeroed
    pub fn new(action: TouchAction, x: f32, y: f32) -> Self {
        Self {
            action,
            pointer_id: 0,
            x,
            y,
            pressure: 0.0,
            size: 0.0,
            velocity_x: 0.0,
            velocity_y: 0.0,
        }
    }

    /// Wrap this sample into a record
    pub fn into_record(self) -> EventRecord {
        let payload = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        EventRecord::new(EventKind::Touch, payload)
    }
}

/// Device identity snapshot sent once per session.
///
/// Gathering these values is the host platform's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// Collector-assigned identity, if already known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    pub platform: String,
    pub os_version: String,
    pub model: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub screen_density: f32,
    pub locale: String,
    pub timezone: String,
}

impl DeviceFingerprint {
    /// Wrap this fingerprint into a record
    pub fn into_record(self) -> EventRecord {
        let payload = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        EventRecord::new(EventKind::Fingerprint, payload)
    }
}
