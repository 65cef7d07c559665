use crate::db::models::{ArchivedCopy, Event, EventCategory, EventFilter, NativeKey, NewEvent};
use crate::db::repositories::EventStore;
use crate::error::{Error, Result};
use crate::sync::presence::PresenceVector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process event store, selected with `database.url = "memory://"`.
/// Rows are lost on restart.
#[derive(Default)]
pub struct MemoryEventsRepository {
    events: RwLock<HashMap<Uuid, Event>>,
}

impl MemoryEventsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    async fn update<F>(&self, id: &Uuid, f: F) -> Result<Event>
    where
        F: FnOnce(&mut Event),
    {
        let mut events = self.events.write().await;
        let event = events
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Event {} not found", id)))?;
        f(event);
        Ok(event.clone())
    }
}

#[async_trait]
impl EventStore for MemoryEventsRepository {
    async fn get(&self, id: &Uuid) -> Result<Option<Event>> {
        Ok(self.events.read().await.get(id).cloned())
    }

    async fn find_by_key(
        &self,
        camera_id: &Uuid,
        native_key: &NativeKey,
    ) -> Result<Option<Event>> {
        Ok(self
            .events
            .read()
            .await
            .values()
            .find(|e| e.camera_id == *camera_id && e.native_key == *native_key)
            .cloned())
    }

    async fn insert(&self, new: NewEvent) -> Result<Event> {
        let mut events = self.events.write().await;
        if events
            .values()
            .any(|e| e.camera_id == new.camera_id && e.native_key == new.native_key)
        {
            return Err(Error::Database(format!(
                "duplicate key value violates unique constraint: {}",
                new.native_key
            )));
        }

        let event = Event::from_new(new, Utc::now());
        events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn adopt_orphan(
        &self,
        id: &Uuid,
        triggered_at: DateTime<Utc>,
        display_name: Option<String>,
    ) -> Result<Event> {
        self.update(id, |e| {
            e.orphaned = false;
            e.triggered_at = triggered_at;
            if display_name.is_some() {
                e.display_name = display_name;
            }
            e.updated_at = Utc::now();
        })
        .await
    }

    async fn search(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut matched: Vec<Event> = events
            .values()
            .filter(|e| filter.camera_id.map_or(true, |id| e.camera_id == id))
            .filter(|e| filter.category.map_or(true, |c| e.category == c))
            .filter(|e| filter.orphaned.map_or(true, |o| e.orphaned == o))
            .filter(|e| filter.include_purged || e.purged_at.is_none())
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(100).max(0) as usize;
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn record_archived(&self, copy: &ArchivedCopy, at: DateTime<Utc>) -> Result<()> {
        self.update(&copy.event_id, |e| {
            e.local_path = Some(copy.local_path.clone());
            e.file_size = Some(copy.file_size);
            e.content_type = Some(copy.content_type.clone());
            e.thumbnail_path = copy.thumbnail_path.clone();
            e.ingested_at = Some(at);
            e.ingest_error = None;
            e.purged_at = None;
            e.updated_at = at;
        })
        .await
        .map(|_| ())
    }

    async fn record_ingest_error(&self, id: &Uuid, reason: &str) -> Result<()> {
        self.update(id, |e| {
            e.ingest_error = Some(reason.to_string());
            e.updated_at = Utc::now();
        })
        .await
        .map(|_| ())
    }

    async fn clear_local(&self, id: &Uuid) -> Result<()> {
        self.update(id, |e| {
            e.local_path = None;
            e.thumbnail_path = None;
            e.updated_at = Utc::now();
        })
        .await
        .map(|_| ())
    }

    async fn record_device_deleted(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |e| {
            e.device_deleted_at = Some(at);
            e.updated_at = at;
        })
        .await
        .map(|_| ())
    }

    async fn save_presence(
        &self,
        id: &Uuid,
        presence: &PresenceVector,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |e| {
            e.presence = *presence;
            e.presence_checked_at = Some(at);
        })
        .await
        .map(|_| ())
    }

    async fn mark_purged(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |e| {
            e.purged_at = Some(at);
            e.updated_at = at;
        })
        .await
        .map(|_| ())
    }

    async fn retention_candidates(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut candidates: Vec<Event> = events
            .values()
            .filter(|e| e.category == category)
            .filter(|e| e.triggered_at <= cutoff)
            .filter(|e| e.purged_at.is_none())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.triggered_at.cmp(&b.triggered_at));
        Ok(candidates)
    }
}
