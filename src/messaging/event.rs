use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Event types supported by the system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    // Lifecycle events
    EventPresenceChanged,
    EventOrphaned,
    EventIngested,
    EventIngestFailed,
    EventDeletedLocal,
    EventDeletedFromDevice,
    EventPurged,

    // Sync events
    SyncCompleted,
    CameraOnline,
    CameraOffline,

    // Retention events
    RetentionSweepStarted,
    RetentionSweepCompleted,

    // System events
    SystemStartup,
    SystemShutdown,

    // Custom event
    Custom(String),
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventPresenceChanged => write!(f, "event.presence_changed"),
            Self::EventOrphaned => write!(f, "event.orphaned"),
            Self::EventIngested => write!(f, "event.ingested"),
            Self::EventIngestFailed => write!(f, "event.ingest_failed"),
            Self::EventDeletedLocal => write!(f, "event.deleted_local"),
            Self::EventDeletedFromDevice => write!(f, "event.deleted_from_device"),
            Self::EventPurged => write!(f, "event.purged"),
            Self::SyncCompleted => write!(f, "sync.completed"),
            Self::CameraOnline => write!(f, "camera.online"),
            Self::CameraOffline => write!(f, "camera.offline"),
            Self::RetentionSweepStarted => write!(f, "retention.sweep_started"),
            Self::RetentionSweepCompleted => write!(f, "retention.sweep_completed"),
            Self::SystemStartup => write!(f, "system.startup"),
            Self::SystemShutdown => write!(f, "system.shutdown"),
            Self::Custom(name) => write!(f, "custom.{}", name),
        }
    }
}

/// Event message structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMessage {
    /// Unique message ID
    pub id: Uuid,
    pub event_type: EventType,
    /// Source of the message (event ID or camera ID)
    pub source_id: Option<Uuid>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl EventMessage {
    /// Create a new event message
    pub fn new<T: Serialize>(
        event_type: EventType,
        source_id: Option<Uuid>,
        payload: T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            source_id,
            timestamp: chrono::Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create a new event message with empty payload
    pub fn new_empty(event_type: EventType, source_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source_id,
            timestamp: chrono::Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    /// Get the routing key for the event
    pub fn routing_key(&self) -> String {
        match &self.source_id {
            Some(id) => format!("{}.{}", self.event_type, id),
            None => self.event_type.to_string(),
        }
    }
}
