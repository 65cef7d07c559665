use crate::db::models::{
    ArchivedCopy, Event, EventCategory, EventDb, EventFilter, NativeKey, NewEvent,
};
use crate::db::repositories::EventStore;
use crate::error::{Error, Result};
use crate::sync::presence::PresenceVector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgQueryResult;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const EVENT_COLUMNS: &str = r#"
    id, camera_id, native_key, display_name, category, triggered_at, extension,
    file_size, content_type, local_path, thumbnail_path, orphaned, ingested_at,
    ingest_error, device_deleted_at, purged_at, device_presence, transfer_presence,
    local_presence, presence_checked_at, is_played, created_at, updated_at
"#;

/// Events repository backed by PostgreSQL
#[derive(Clone)]
pub struct EventsRepository {
    pool: Arc<PgPool>,
}

impl EventsRepository {
    /// Create a new events repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn expect_row(result: PgQueryResult, id: &Uuid) -> Result<()> {
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Event {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for EventsRepository {
    async fn get(&self, id: &Uuid) -> Result<Option<Event>> {
        let sql = format!("SELECT {} FROM events WHERE id = $1", EVENT_COLUMNS);
        let result = sqlx::query_as::<_, EventDb>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get event by ID: {}", e)))?;

        Ok(result.map(Event::from))
    }

    async fn find_by_key(
        &self,
        camera_id: &Uuid,
        native_key: &NativeKey,
    ) -> Result<Option<Event>> {
        let sql = format!(
            "SELECT {} FROM events WHERE camera_id = $1 AND native_key = $2",
            EVENT_COLUMNS
        );
        let result = sqlx::query_as::<_, EventDb>(&sql)
            .bind(camera_id)
            .bind(native_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find event by key: {}", e)))?;

        Ok(result.map(Event::from))
    }

    async fn insert(&self, new: NewEvent) -> Result<Event> {
        let event = EventDb::from(Event::from_new(new, Utc::now()));

        let sql = format!(
            r#"
            INSERT INTO events (
                id, camera_id, native_key, display_name, category, triggered_at, extension,
                orphaned, device_presence, transfer_presence, local_presence, is_played,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {}
            "#,
            EVENT_COLUMNS
        );

        let result = sqlx::query_as::<_, EventDb>(&sql)
            .bind(event.id)
            .bind(event.camera_id)
            .bind(&event.native_key)
            .bind(&event.display_name)
            .bind(event.category)
            .bind(event.triggered_at)
            .bind(&event.extension)
            .bind(event.orphaned)
            .bind(event.device_presence)
            .bind(event.transfer_presence)
            .bind(event.local_presence)
            .bind(event.is_played)
            .bind(event.created_at)
            .bind(event.updated_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to create event: {}", e)))?;

        debug!("Inserted event {} ({})", result.id, result.native_key);
        Ok(Event::from(result))
    }

    async fn adopt_orphan(
        &self,
        id: &Uuid,
        triggered_at: DateTime<Utc>,
        display_name: Option<String>,
    ) -> Result<Event> {
        let sql = format!(
            r#"
            UPDATE events
            SET orphaned = FALSE, triggered_at = $1,
                display_name = COALESCE($2, display_name), updated_at = $3
            WHERE id = $4
            RETURNING {}
            "#,
            EVENT_COLUMNS
        );

        let result = sqlx::query_as::<_, EventDb>(&sql)
            .bind(triggered_at)
            .bind(display_name)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to adopt orphan event: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Event {} not found", id)))?;

        Ok(Event::from(result))
    }

    async fn search(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let limit = filter.limit.unwrap_or(100);
        let offset = filter.offset.unwrap_or(0);

        let mut sql = format!("SELECT {} FROM events WHERE 1=1", EVENT_COLUMNS);
        let mut param_index = 1;

        if filter.camera_id.is_some() {
            sql.push_str(&format!(" AND camera_id = ${}", param_index));
            param_index += 1;
        }

        if filter.category.is_some() {
            sql.push_str(&format!(" AND category = ${}", param_index));
            param_index += 1;
        }

        if filter.orphaned.is_some() {
            sql.push_str(&format!(" AND orphaned = ${}", param_index));
            param_index += 1;
        }

        if !filter.include_purged {
            sql.push_str(" AND purged_at IS NULL");
        }

        sql.push_str(" ORDER BY triggered_at DESC");
        sql.push_str(&format!(
            " LIMIT ${} OFFSET ${}",
            param_index,
            param_index + 1
        ));

        let mut query = sqlx::query_as::<_, EventDb>(&sql);

        if let Some(camera_id) = filter.camera_id {
            query = query.bind(camera_id);
        }
        if let Some(category) = filter.category {
            query = query.bind(category);
        }
        if let Some(orphaned) = filter.orphaned {
            query = query.bind(orphaned);
        }

        let result = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to search events: {}", e)))?;

        Ok(result.into_iter().map(Event::from).collect())
    }

    async fn record_archived(&self, copy: &ArchivedCopy, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET local_path = $1, file_size = $2, content_type = $3, thumbnail_path = $4,
                ingested_at = $5, ingest_error = NULL, purged_at = NULL, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(copy.local_path.to_string_lossy().to_string())
        .bind(copy.file_size as i64)
        .bind(&copy.content_type)
        .bind(
            copy.thumbnail_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(at)
        .bind(copy.event_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record archived copy: {}", e)))?;

        Self::expect_row(result, &copy.event_id)
    }

    async fn record_ingest_error(&self, id: &Uuid, reason: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE events SET ingest_error = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record ingest error: {}", e)))?;

        Self::expect_row(result, id)
    }

    async fn clear_local(&self, id: &Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET local_path = NULL, thumbnail_path = NULL, updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to clear local copy: {}", e)))?;

        Self::expect_row(result, id)
    }

    async fn record_device_deleted(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE events SET device_deleted_at = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(at)
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record device deletion: {}", e)))?;

        Self::expect_row(result, id)
    }

    async fn save_presence(
        &self,
        id: &Uuid,
        presence: &PresenceVector,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET device_presence = $1, transfer_presence = $2, local_presence = $3,
                presence_checked_at = $4
            WHERE id = $5
            "#,
        )
        .bind(presence.device)
        .bind(presence.transfer)
        .bind(presence.local)
        .bind(at)
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to save presence: {}", e)))?;

        Self::expect_row(result, id)
    }

    async fn mark_purged(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE events SET purged_at = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(at)
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to mark event purged: {}", e)))?;

        Self::expect_row(result, id)
    }

    async fn retention_candidates(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM events
            WHERE category = $1
              AND triggered_at <= $2
              AND purged_at IS NULL
            ORDER BY triggered_at ASC
            "#,
            EVENT_COLUMNS
        );

        let result = sqlx::query_as::<_, EventDb>(&sql)
            .bind(category)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| {
                Error::Database(format!("Failed to get retention candidates: {}", e))
            })?;

        Ok(result.into_iter().map(Event::from).collect())
    }
}
