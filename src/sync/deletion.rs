use crate::db::models::Event;
use crate::db::repositories::EventStore;
use crate::error::{Error, Result};
use crate::stores::{ArchiveStore, CameraRegistry, DeviceStore};
use crate::sync::archive_path;
use crate::sync::clock::Clock;
use crate::sync::locks::KeyedLocks;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

/// What a local deletion actually removed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalDeletion {
    pub event_id: Uuid,
    pub removed_file: bool,
    pub removed_thumbnail: bool,
}

/// Deletes one event copy from exactly one store per call. Nothing here
/// cascades to another store.
pub struct DeletionCoordinator {
    registry: Arc<CameraRegistry>,
    store: Arc<dyn EventStore>,
    device: Arc<dyn DeviceStore>,
    archive: Arc<dyn ArchiveStore>,
    locks: Arc<KeyedLocks<Uuid>>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl DeletionCoordinator {
    pub fn new(
        registry: Arc<CameraRegistry>,
        store: Arc<dyn EventStore>,
        device: Arc<dyn DeviceStore>,
        archive: Arc<dyn ArchiveStore>,
        locks: Arc<KeyedLocks<Uuid>>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            device,
            archive,
            locks,
            clock,
            call_timeout,
        }
    }

    async fn load(&self, event_id: &Uuid) -> Result<Event> {
        self.store
            .get(event_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Event {} not found", event_id)))
    }

    /// Remove the archived file and thumbnail. Succeeds when nothing is
    /// left to remove.
    pub async fn delete_local(&self, event_id: &Uuid) -> Result<LocalDeletion> {
        let _guard = self.locks.lock(*event_id).await;
        let event = self.load(event_id).await?;

        let removed_file = match archive_path(self.archive.as_ref(), &event) {
            Some(path) => self.archive.delete(&path).await?,
            None => false,
        };

        let thumbnail = event
            .thumbnail_path
            .clone()
            .unwrap_or_else(|| self.archive.thumbnail_path_for(&event.camera_id, &event.native_key));
        let removed_thumbnail = self.archive.delete(&thumbnail).await?;

        if event.local_path.is_some() || event.thumbnail_path.is_some() {
            self.store.clear_local(&event.id).await?;
        }

        if removed_file {
            info!("Deleted local copy of event {} ({})", event.id, event.native_key);
        } else {
            debug!("Event {} had no local copy to delete", event.id);
        }

        Ok(LocalDeletion {
            event_id: event.id,
            removed_file,
            removed_thumbnail,
        })
    }

    /// Ask the device to delete its copy. Fails fast when the device cannot
    /// be reached; a device that no longer has the event counts as success.
    pub async fn delete_from_device(&self, event_id: &Uuid) -> Result<()> {
        let _guard = self.locks.lock(*event_id).await;
        let event = self.load(event_id).await?;
        let camera = self.registry.get(&event.camera_id)?;

        let result = match timeout(
            self.call_timeout,
            self.device.delete_event(camera, &event.native_key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::DeviceUnreachable(format!(
                "deleting {} on {} timed out after {:?}",
                event.native_key, camera.name, self.call_timeout
            ))),
        };

        match result {
            Ok(()) => info!(
                "Deleted event {} ({}) from device {}",
                event.id, event.native_key, camera.name
            ),
            Err(Error::NotFound(_)) => debug!(
                "Device {} no longer has {}, nothing to delete",
                camera.name, event.native_key
            ),
            Err(e) => {
                warn!(
                    "Failed to delete {} from device {}: {}",
                    event.native_key, camera.name, e
                );
                return Err(e);
            }
        }

        self.store
            .record_device_deleted(&event.id, self.clock.now())
            .await
    }
}
