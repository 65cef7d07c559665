use crate::db::models::{ArchivedCopy, Event};
use crate::messaging::broker::MessageBrokerTrait;
use crate::messaging::event::{EventMessage, EventType};
use crate::sync::presence::{LifecycleState, PresenceVector};
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Helper for publishing event lifecycle signals.
///
/// Publishing is fire-and-forget from the caller's point of view: broker
/// failures are logged and never fail the operation that produced them.
#[derive(Clone, Default)]
pub struct EventNotifier {
    broker: Option<Arc<dyn MessageBrokerTrait>>,
}

impl EventNotifier {
    pub fn new(broker: Arc<dyn MessageBrokerTrait>) -> Self {
        Self {
            broker: Some(broker),
        }
    }

    /// A notifier that drops every signal
    pub fn disabled() -> Self {
        Self { broker: None }
    }

    async fn emit<T: Serialize>(&self, event_type: EventType, source_id: Option<Uuid>, payload: T) {
        let Some(broker) = &self.broker else {
            return;
        };

        let message = match EventMessage::new(event_type.clone(), source_id, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to encode {} message: {}", event_type, e);
                return;
            }
        };

        let routing_key = message.routing_key();
        if let Err(e) = broker.publish(message).await {
            warn!("Failed to publish {}: {}", routing_key, e);
        } else {
            debug!("Published {}", routing_key);
        }
    }

    /// The presence snapshot of an event changed
    pub async fn presence_changed(
        &self,
        event_id: Uuid,
        presence: &PresenceVector,
        state: Option<LifecycleState>,
    ) {
        let payload = serde_json::json!({
            "event_id": event_id,
            "presence": presence,
            "state": state,
        });
        self.emit(EventType::EventPresenceChanged, Some(event_id), payload)
            .await;
    }

    pub async fn orphaned(&self, event: &Event) {
        let payload = serde_json::json!({
            "event_id": event.id,
            "camera_id": event.camera_id,
            "native_key": event.native_key,
        });
        self.emit(EventType::EventOrphaned, Some(event.id), payload)
            .await;
    }

    pub async fn ingested(&self, copy: &ArchivedCopy) {
        self.emit(EventType::EventIngested, Some(copy.event_id), copy)
            .await;
    }

    pub async fn ingest_failed(&self, event_id: Uuid, reason: &str) {
        let payload = serde_json::json!({
            "event_id": event_id,
            "reason": reason,
        });
        self.emit(EventType::EventIngestFailed, Some(event_id), payload)
            .await;
    }

    pub async fn deleted_local(&self, event_id: Uuid, removed_file: bool) {
        let payload = serde_json::json!({
            "event_id": event_id,
            "removed_file": removed_file,
        });
        self.emit(EventType::EventDeletedLocal, Some(event_id), payload)
            .await;
    }

    pub async fn deleted_from_device(&self, event_id: Uuid, camera_id: Uuid) {
        let payload = serde_json::json!({
            "event_id": event_id,
            "camera_id": camera_id,
        });
        self.emit(EventType::EventDeletedFromDevice, Some(event_id), payload)
            .await;
    }

    pub async fn purged(&self, event_id: Uuid) {
        self.emit(
            EventType::EventPurged,
            Some(event_id),
            serde_json::json!({ "event_id": event_id }),
        )
        .await;
    }

    pub async fn sync_completed<T: Serialize>(&self, summary: &T) {
        self.emit(EventType::SyncCompleted, None, summary).await;
    }

    /// A camera's reachability changed
    pub async fn camera_status(&self, camera_id: Uuid, name: &str, online: bool) {
        let event_type = if online {
            EventType::CameraOnline
        } else {
            EventType::CameraOffline
        };
        let payload = serde_json::json!({
            "camera_id": camera_id,
            "name": name,
            "online": online,
        });
        self.emit(event_type, Some(camera_id), payload).await;
    }

    pub async fn sweep_started(&self) {
        self.emit(EventType::RetentionSweepStarted, None, serde_json::json!({}))
            .await;
    }

    pub async fn sweep_completed<T: Serialize>(&self, report: &T) {
        self.emit(EventType::RetentionSweepCompleted, None, report)
            .await;
    }

    pub async fn system(&self, event_type: EventType, component: &str) {
        self.emit(event_type, None, serde_json::json!({ "component": component }))
            .await;
    }
}
