use crate::db::models::{ArchivedCopy, Event, EventCategory, EventFilter, NativeKey, NewEvent};
use crate::error::Result;
use crate::sync::presence::PresenceVector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod events;
pub mod memory;

pub use events::EventsRepository;
pub use memory::MemoryEventsRepository;

/// Persistence for event rows.
///
/// Mutations address one event by id and fail with `Error::NotFound` when
/// the row does not exist. Uniqueness of `(camera_id, native_key)` is
/// guaranteed by the resolver's per-key lock, not by callers racing on
/// `insert`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get(&self, id: &Uuid) -> Result<Option<Event>>;

    async fn find_by_key(&self, camera_id: &Uuid, native_key: &NativeKey)
        -> Result<Option<Event>>;

    async fn insert(&self, new: NewEvent) -> Result<Event>;

    /// Attach device metadata to an orphan once its device record shows up
    async fn adopt_orphan(
        &self,
        id: &Uuid,
        triggered_at: DateTime<Utc>,
        display_name: Option<String>,
    ) -> Result<Event>;

    async fn search(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    async fn record_archived(&self, copy: &ArchivedCopy, at: DateTime<Utc>) -> Result<()>;

    async fn record_ingest_error(&self, id: &Uuid, reason: &str) -> Result<()>;

    /// Forget the archived file and thumbnail paths
    async fn clear_local(&self, id: &Uuid) -> Result<()>;

    async fn record_device_deleted(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn save_presence(
        &self,
        id: &Uuid,
        presence: &PresenceVector,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_purged(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Unpurged events of `category` with `triggered_at <= cutoff`, oldest
    /// first. Whether a local copy exists is for the caller to find out.
    async fn retention_candidates(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>>;
}
