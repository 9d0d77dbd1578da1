//! Event types for the archive event system
//!
//! Components emit lifecycle events on a broadcast bus. Emission is lossy:
//! nobody listening is not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Archive lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ArchiveEvent {
    /// A frame row was created
    FrameIngested {
        hash: String,
        frame_type: String,
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A new session was opened by the grouper
    SessionCreated {
        session_id: Uuid,
        frame_type: String,
        object_name: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A master frame was registered
    MasterRegistered {
        master_id: Uuid,
        master_type: String,
        source_session_id: Uuid,
        validated: bool,
        timestamp: DateTime<Utc>,
    },

    /// An older master of the same source session was superseded
    MasterSuperseded {
        master_id: Uuid,
        superseded_by: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Storage tier transition of a frame or master
    TierChanged {
        subject: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    /// Light session calibration could not be resolved yet
    CalibrationDeferred {
        session_id: Uuid,
        role: String,
        timestamp: DateTime<Utc>,
    },

    /// Bulk ingestion progress
    IngestProgress {
        processed: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for archive events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ArchiveEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ArchiveEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for archive event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
