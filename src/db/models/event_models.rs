use crate::sync::presence::{Presence, PresenceVector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use uuid::Uuid;

/// Device-assigned identifier that correlates a device record with a
/// transfer-store file (the device's file name without extension)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct NativeKey(String);

impl NativeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Validate a key received from a device or the transfer store. Keys
    /// become archive file names, so anything that could leave the camera
    /// directory is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim();
        if key.is_empty()
            || key == "."
            || key.contains("..")
            || key.contains(['/', '\\', '\0'])
        {
            return None;
        }
        Some(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NativeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NativeKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Event category, selects the retention policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Triggered recording (video clip)
    Event,
    /// Still image
    Snapshot,
}

impl EventCategory {
    pub const ALL: [EventCategory; 2] = [EventCategory::Event, EventCategory::Snapshot];

    /// Images are snapshots, everything else is a recorded event
    pub fn from_extension(extension: Option<&str>) -> Self {
        match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
            Some("jpg") | Some("jpeg") | Some("png") => EventCategory::Snapshot,
            _ => EventCategory::Event,
        }
    }
}

impl Display for EventCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Event => write!(f, "event"),
            EventCategory::Snapshot => write!(f, "snapshot"),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for EventCategory {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("text")
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for EventCategory {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let s = self.to_string();
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&s.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for EventCategory {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let text = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(match text.as_str() {
            "snapshot" => EventCategory::Snapshot,
            _ => EventCategory::Event,
        })
    }
}

impl sqlx::Type<sqlx::Postgres> for Presence {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("text")
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for Presence {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let s = self.to_string();
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&s.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Presence {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let text = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        // Anything unreadable is treated as not observed
        Ok(text.parse().unwrap_or(Presence::Unknown))
    }
}

/// Event model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub camera_id: Uuid,
    pub native_key: NativeKey,
    pub display_name: Option<String>,
    pub category: EventCategory,
    pub triggered_at: DateTime<Utc>,
    /// File extension reported by the device or seen in the transfer store
    pub extension: Option<String>,
    pub file_size: Option<u64>,
    pub content_type: Option<String>,
    pub local_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
    /// Synthesised from a transfer-store file with no device record
    pub orphaned: bool,
    /// Set on every successful ingest; not cleared by local deletion
    pub ingested_at: Option<DateTime<Utc>>,
    pub ingest_error: Option<String>,
    pub device_deleted_at: Option<DateTime<Utc>>,
    pub purged_at: Option<DateTime<Utc>>,
    /// Last persisted presence snapshot, for display only
    pub presence: PresenceVector,
    pub presence_checked_at: Option<DateTime<Utc>>,
    pub is_played: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Build a fresh row for a newly observed event
    pub fn from_new(new: NewEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera_id: new.camera_id,
            native_key: new.native_key,
            display_name: new.display_name,
            category: new.category,
            triggered_at: new.triggered_at,
            extension: new.extension,
            file_size: None,
            content_type: None,
            local_path: None,
            thumbnail_path: None,
            orphaned: new.orphaned,
            ingested_at: None,
            ingest_error: None,
            device_deleted_at: None,
            purged_at: None,
            presence: PresenceVector::unknown(),
            presence_checked_at: None,
            is_played: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventDb {
    pub id: Uuid,
    pub camera_id: Uuid,
    pub native_key: NativeKey,
    pub display_name: Option<String>,
    pub category: EventCategory,
    pub triggered_at: DateTime<Utc>,
    pub extension: Option<String>,
    pub file_size: Option<i64>,
    pub content_type: Option<String>,
    pub local_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub orphaned: bool,
    pub ingested_at: Option<DateTime<Utc>>,
    pub ingest_error: Option<String>,
    pub device_deleted_at: Option<DateTime<Utc>>,
    pub purged_at: Option<DateTime<Utc>>,
    pub device_presence: Presence,
    pub transfer_presence: Presence,
    pub local_presence: Presence,
    pub presence_checked_at: Option<DateTime<Utc>>,
    pub is_played: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<EventDb> for Event {
    fn from(db: EventDb) -> Self {
        Self {
            id: db.id,
            camera_id: db.camera_id,
            native_key: db.native_key,
            display_name: db.display_name,
            category: db.category,
            triggered_at: db.triggered_at,
            extension: db.extension,
            file_size: db.file_size.map(|s| s as u64),
            content_type: db.content_type,
            local_path: db.local_path.map(PathBuf::from),
            thumbnail_path: db.thumbnail_path.map(PathBuf::from),
            orphaned: db.orphaned,
            ingested_at: db.ingested_at,
            ingest_error: db.ingest_error,
            device_deleted_at: db.device_deleted_at,
            purged_at: db.purged_at,
            presence: PresenceVector::new(
                db.device_presence,
                db.transfer_presence,
                db.local_presence,
            ),
            presence_checked_at: db.presence_checked_at,
            is_played: db.is_played,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

impl From<Event> for EventDb {
    fn from(e: Event) -> Self {
        Self {
            id: e.id,
            camera_id: e.camera_id,
            native_key: e.native_key,
            display_name: e.display_name,
            category: e.category,
            triggered_at: e.triggered_at,
            extension: e.extension,
            file_size: e.file_size.map(|s| s as i64),
            content_type: e.content_type,
            local_path: e.local_path.map(|p| p.to_string_lossy().to_string()),
            thumbnail_path: e.thumbnail_path.map(|p| p.to_string_lossy().to_string()),
            orphaned: e.orphaned,
            ingested_at: e.ingested_at,
            ingest_error: e.ingest_error,
            device_deleted_at: e.device_deleted_at,
            purged_at: e.purged_at,
            device_presence: e.presence.device,
            transfer_presence: e.presence.transfer,
            local_presence: e.presence.local,
            presence_checked_at: e.presence_checked_at,
            is_played: e.is_played,
            created_at: e.created_at,
            updated_at: e.updated_at,
        }
    }
}

/// Fields known when an event is first observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub camera_id: Uuid,
    pub native_key: NativeKey,
    pub display_name: Option<String>,
    pub category: EventCategory,
    pub triggered_at: DateTime<Utc>,
    pub extension: Option<String>,
    pub orphaned: bool,
}

/// Result of a successful ingest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivedCopy {
    pub event_id: Uuid,
    pub local_path: PathBuf,
    pub file_size: u64,
    pub content_type: String,
    pub thumbnail_path: Option<PathBuf>,
}

/// Search filter for listing events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub camera_id: Option<Uuid>,
    pub category: Option<EventCategory>,
    pub orphaned: Option<bool>,
    /// Include events already marked purged
    #[serde(default)]
    pub include_purged: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_follows_extension() {
        assert_eq!(
            EventCategory::from_extension(Some("JPG")),
            EventCategory::Snapshot
        );
        assert_eq!(
            EventCategory::from_extension(Some("mp4")),
            EventCategory::Event
        );
        assert_eq!(EventCategory::from_extension(None), EventCategory::Event);
    }

    #[test]
    fn native_keys_must_stay_inside_the_camera_dir() {
        assert_eq!(NativeKey::parse(" EVT-0001 ").unwrap().as_str(), "EVT-0001");
        assert!(NativeKey::parse("clip.2024").is_some());
        for bad in ["", "  ", ".", "..", "../x", "a/b", "a\\b", "x/../y"] {
            assert!(NativeKey::parse(bad).is_none(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn new_rows_start_unobserved() {
        let event = Event::from_new(
            NewEvent {
                camera_id: Uuid::new_v4(),
                native_key: "EVT-0001".into(),
                display_name: None,
                category: EventCategory::Event,
                triggered_at: Utc::now(),
                extension: Some("mp4".into()),
                orphaned: false,
            },
            Utc::now(),
        );
        assert_eq!(event.presence, PresenceVector::unknown());
        assert!(event.local_path.is_none());
        assert!(event.ingested_at.is_none());
    }
}
