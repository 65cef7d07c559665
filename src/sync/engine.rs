//! Facade the API and scheduler drive the sync core through.

use crate::config::Config;
use crate::db::models::{ArchivedCopy, Event, EventFilter};
use crate::db::repositories::EventStore;
use crate::error::{Error, Result};
use crate::messaging::EventNotifier;
use crate::stores::{content_type_for, ArchiveStore, CameraRegistry, DeviceStore, TransferStore};
use crate::sync::clock::Clock;
use crate::sync::archive_path;
use crate::sync::deletion::{DeletionCoordinator, LocalDeletion};
use crate::sync::health::CameraHealthMonitor;
use crate::sync::ingest::IngestPipeline;
use crate::sync::locks::KeyedLocks;
use crate::sync::presence::{LifecycleState, PresenceVector};
use crate::sync::prober::SyncProber;
use crate::sync::resolver::{EventResolver, Resolution};
use crate::sync::retention::{RetentionPreview, RetentionSweeper, SweepReport};
use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Counts from one sync pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub cameras: usize,
    pub devices_unreachable: usize,
    /// Distinct events seen in any store during the pass
    pub resolved: usize,
    pub created: usize,
    pub orphaned: usize,
    pub adopted: usize,
    pub ingested: usize,
    pub ingest_failed: usize,
}

/// A file in the archive ready to be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

pub struct SyncEngine {
    registry: Arc<CameraRegistry>,
    store: Arc<dyn EventStore>,
    transfer: Arc<dyn TransferStore>,
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    notifier: EventNotifier,
    prober: Arc<SyncProber>,
    resolver: Arc<EventResolver>,
    ingest: Arc<IngestPipeline>,
    deletion: Arc<DeletionCoordinator>,
    retention: Arc<RetentionSweeper>,
    health: Arc<CameraHealthMonitor>,
    auto_ingest: bool,
    ingest_concurrency: usize,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn EventStore>,
        device: Arc<dyn DeviceStore>,
        transfer: Arc<dyn TransferStore>,
        archive: Arc<dyn ArchiveStore>,
        clock: Arc<dyn Clock>,
        notifier: EventNotifier,
    ) -> Self {
        let registry = Arc::new(CameraRegistry::new(config.cameras.clone()));
        let locks = Arc::new(KeyedLocks::new());

        let prober = Arc::new(SyncProber::new(
            &config.probe,
            registry.clone(),
            device.clone(),
            transfer.clone(),
            archive.clone(),
        ));
        let resolver = Arc::new(EventResolver::new(
            store.clone(),
            clock.clone(),
            config.resolver.orphan_grace_secs,
        ));
        let ingest = Arc::new(IngestPipeline::new(
            &config.ingest,
            config.archive.thumbnail_max_dimension,
            registry.clone(),
            store.clone(),
            transfer.clone(),
            archive.clone(),
            locks.clone(),
            clock.clone(),
        ));
        let deletion = Arc::new(DeletionCoordinator::new(
            registry.clone(),
            store.clone(),
            device,
            archive.clone(),
            locks,
            clock.clone(),
            config.probe.call_timeout(),
        ));
        let retention = Arc::new(RetentionSweeper::new(
            config.retention.clone(),
            store.clone(),
            deletion.clone(),
            archive.clone(),
            clock.clone(),
            notifier.clone(),
        ));
        let health = Arc::new(CameraHealthMonitor::new(
            registry.clone(),
            prober.clone(),
            clock.clone(),
            notifier.clone(),
        ));

        Self {
            registry,
            store,
            transfer,
            archive,
            clock,
            notifier,
            prober,
            resolver,
            ingest,
            deletion,
            retention,
            health,
            auto_ingest: config.ingest.auto_ingest,
            ingest_concurrency: config.probe.worker_pool_size.max(1),
        }
    }

    pub fn prober(&self) -> &Arc<SyncProber> {
        &self.prober
    }

    pub fn resolver(&self) -> &Arc<EventResolver> {
        &self.resolver
    }

    pub fn ingest_pipeline(&self) -> &Arc<IngestPipeline> {
        &self.ingest
    }

    pub fn deletion(&self) -> &Arc<DeletionCoordinator> {
        &self.deletion
    }

    pub fn retention(&self) -> &Arc<RetentionSweeper> {
        &self.retention
    }

    pub fn health(&self) -> &Arc<CameraHealthMonitor> {
        &self.health
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    async fn load(&self, event_id: &Uuid) -> Result<Event> {
        self.store
            .get(event_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Event {} not found", event_id)))
    }

    pub async fn get_event(&self, event_id: &Uuid) -> Result<Event> {
        self.load(event_id).await
    }

    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.store.search(filter).await
    }

    /// Persist a probe result as the display snapshot. Unknown components
    /// keep their last good value. Publishes a presence change when the
    /// snapshot moved.
    async fn record_presence(&self, event: &Event, presence: PresenceVector) {
        let snapshot = presence.with_last_good(&event.presence);
        if let Err(e) = self
            .store
            .save_presence(&event.id, &snapshot, self.clock.now())
            .await
        {
            warn!("Failed to save presence of event {}: {}", event.id, e);
            return;
        }

        if snapshot != event.presence {
            let state = LifecycleState::from_presence(&snapshot, event.orphaned);
            self.notifier
                .presence_changed(event.id, &snapshot, state)
                .await;
        }
    }

    /// Presence of one event. Unknown stays unknown in the returned vector;
    /// only the stored snapshot falls back to last good values.
    pub async fn get_presence(&self, event_id: &Uuid, force: bool) -> Result<PresenceVector> {
        let event = self.load(event_id).await?;
        let presence = self.prober.probe(&event, force).await;
        self.record_presence(&event, presence).await;
        Ok(presence)
    }

    /// The archived copy of an event, read from the archive itself
    pub async fn archived_file(&self, event_id: &Uuid) -> Result<ArchivedFile> {
        let event = self.load(event_id).await?;
        let missing = || Error::NotFound(format!("Event {} has no local copy", event.id));

        let path = archive_path(self.archive.as_ref(), &event).ok_or_else(missing)?;
        let size = self.archive.size_of(&path).await?.ok_or_else(missing)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| event.native_key.to_string());
        let content_type = event.content_type.clone().unwrap_or_else(|| {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            content_type_for(ext).to_string()
        });

        Ok(ArchivedFile {
            path,
            file_name,
            content_type,
            size,
        })
    }

    /// The event's thumbnail, when one was generated and is still on disk
    pub async fn thumbnail_file(&self, event_id: &Uuid) -> Result<ArchivedFile> {
        let event = self.load(event_id).await?;
        let path = event
            .thumbnail_path
            .clone()
            .unwrap_or_else(|| self.archive.thumbnail_path_for(&event.camera_id, &event.native_key));
        let size = self.archive.size_of(&path).await?.ok_or_else(|| {
            Error::NotFound(format!("Thumbnail of event {} not available", event.id))
        })?;

        Ok(ArchivedFile {
            file_name: format!("{}.jpg", event.native_key),
            path,
            content_type: "image/jpeg".to_string(),
            size,
        })
    }

    /// Ingest one event now
    pub async fn ingest(&self, event_id: &Uuid) -> Result<ArchivedCopy> {
        let result = self.ingest.ingest(event_id).await;
        self.prober.invalidate(event_id);
        match &result {
            Ok(copy) => {
                self.notifier.ingested(copy).await;
                // The cached device listing is still good; only local moved
                if let Err(e) = self.refresh_presence(event_id, false).await {
                    warn!("Failed to refresh presence of event {}: {}", event_id, e);
                }
            }
            Err(Error::Cancelled(_)) => {}
            Err(e) => self.notifier.ingest_failed(*event_id, &e.to_string()).await,
        }
        result
    }

    /// Reconcile one camera, or every configured camera
    pub async fn trigger_sync(&self, camera_id: Option<Uuid>) -> Result<SyncSummary> {
        let cameras = match camera_id {
            Some(id) => vec![self.registry.get(&id)?],
            None => self.registry.all(),
        };

        let mut summary = SyncSummary::default();
        let mut touched: HashMap<Uuid, Event> = HashMap::new();

        for camera in cameras {
            summary.cameras += 1;

            let listing = match self.prober.fetch_listing(camera).await {
                Ok(records) => Some(records),
                Err(e) => {
                    warn!("Could not list events on {}: {}", camera.name, e);
                    summary.devices_unreachable += 1;
                    self.prober.invalidate_listing(&camera.id);
                    None
                }
            };

            for record in listing.iter().flatten() {
                match self.resolver.resolve_device_record(camera.id, record).await? {
                    Resolution::Created(event) => {
                        summary.created += 1;
                        touched.insert(event.id, event);
                    }
                    Resolution::Adopted(event) => {
                        summary.adopted += 1;
                        touched.insert(event.id, event);
                    }
                    Resolution::Existing(event) => {
                        touched.insert(event.id, event);
                    }
                    Resolution::Pending => {}
                }
            }

            let files = match self.transfer.list(camera).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Could not list transfer files of {}: {}", camera.name, e);
                    continue;
                }
            };

            let mut present = HashSet::new();
            for file in &files {
                present.insert(file.native_key.clone());
                match self
                    .resolver
                    .resolve_transfer_file(camera.id, file, listing.is_some())
                    .await?
                {
                    Resolution::Created(event) => {
                        summary.orphaned += 1;
                        self.notifier.orphaned(&event).await;
                        touched.insert(event.id, event);
                    }
                    Resolution::Existing(event) | Resolution::Adopted(event) => {
                        touched.insert(event.id, event);
                    }
                    Resolution::Pending => {}
                }
            }
            self.resolver.retain_observed(camera.id, &present);
        }

        summary.resolved = touched.len();

        let events: Vec<Event> = touched.into_values().collect();
        for event in &events {
            self.prober.invalidate(&event.id);
        }
        let presences = self.prober.probe_many(&events, false).await;

        let by_id: HashMap<Uuid, &Event> = events.iter().map(|e| (e.id, e)).collect();
        let mut to_ingest = Vec::new();
        for (id, presence) in &presences {
            if let Some(event) = by_id.get(id) {
                self.record_presence(event, *presence).await;
            }
            if self.auto_ingest && presence.needs_ingest() {
                to_ingest.push(*id);
            }
        }

        let results: Vec<bool> = stream::iter(to_ingest)
            .map(|id| async move { self.ingest(&id).await.is_ok() })
            .buffer_unordered(self.ingest_concurrency)
            .collect()
            .await;
        summary.ingested = results.iter().filter(|ok| **ok).count();
        summary.ingest_failed = results.len() - summary.ingested;

        info!(
            "Sync pass over {} cameras: {} events, {} created, {} orphaned, {} ingested, {} failed",
            summary.cameras,
            summary.resolved,
            summary.created,
            summary.orphaned,
            summary.ingested,
            summary.ingest_failed
        );
        self.notifier.sync_completed(&summary).await;

        Ok(summary)
    }

    /// Re-probe an event after a mutation and store the new snapshot
    async fn refresh_presence(&self, event_id: &Uuid, force: bool) -> Result<(Event, PresenceVector)> {
        self.prober.invalidate(event_id);
        let event = self.load(event_id).await?;
        let presence = self.prober.probe(&event, force).await;
        self.record_presence(&event, presence).await;
        Ok((event, presence))
    }

    /// Mark the event purged when a fresh probe finds no copy anywhere
    async fn check_purge(&self, event_id: &Uuid) -> Result<PresenceVector> {
        let (event, presence) = self.refresh_presence(event_id, true).await?;

        if presence.is_fully_absent() && event.purged_at.is_none() {
            self.store.mark_purged(&event.id, self.clock.now()).await?;
            info!("Event {} has no copy left in any store, purged", event.id);
            self.notifier.purged(event.id).await;
        }
        Ok(presence)
    }

    pub async fn request_delete_local(&self, event_id: &Uuid) -> Result<LocalDeletion> {
        let deletion = self.deletion.delete_local(event_id).await?;
        self.notifier
            .deleted_local(*event_id, deletion.removed_file)
            .await;
        self.check_purge(event_id).await?;
        Ok(deletion)
    }

    pub async fn request_delete_from_device(&self, event_id: &Uuid) -> Result<()> {
        self.deletion.delete_from_device(event_id).await?;

        let event = self.load(event_id).await?;
        self.prober.invalidate_listing(&event.camera_id);
        self.notifier
            .deleted_from_device(event.id, event.camera_id)
            .await;
        self.check_purge(event_id).await?;
        Ok(())
    }

    pub async fn retention_preview(&self) -> Result<Vec<RetentionPreview>> {
        self.retention.preview().await
    }

    /// `None` when a sweep was already running
    pub async fn run_retention_sweep(&self) -> Result<Option<SweepReport>> {
        self.retention.sweep().await
    }

    /// Stop ingesting and wait for running ingests to clean up
    pub async fn shutdown(&self) {
        self.ingest.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::EventType;
    use crate::sync::presence::Presence;
    use crate::sync::testing::Harness;
    use chrono::Duration;

    #[tokio::test]
    async fn device_trigger_then_transfer_then_ingest() {
        let h = Harness::with_config(|c| c.ingest.auto_ingest = false).await;
        let event = h.device_event("EVT-0005", 2048).await;

        h.clock.advance(Duration::seconds(1));
        let presence = h.engine.get_presence(&event.id, true).await.unwrap();
        assert_eq!(
            presence,
            PresenceVector::new(Presence::Present, Presence::Absent, Presence::Absent)
        );

        h.clock.advance(Duration::seconds(4));
        h.drop_transfer_file("EVT-0005", 2048);

        h.clock.advance(Duration::seconds(5));
        let presence = h.engine.get_presence(&event.id, true).await.unwrap();
        assert_eq!(
            presence,
            PresenceVector::new(Presence::Present, Presence::Present, Presence::Absent)
        );
        assert!(presence.needs_ingest());

        h.engine.ingest(&event.id).await.unwrap();
        let presence = h.engine.get_presence(&event.id, true).await.unwrap();
        assert_eq!(
            presence,
            PresenceVector::new(Presence::Present, Presence::Present, Presence::Present)
        );
    }

    #[tokio::test]
    async fn sync_pass_ingests_arrived_files() {
        let h = Harness::new().await;
        h.device.add_record(
            h.camera.id,
            crate::stores::DeviceRecord {
                native_key: "EVT-10".into(),
                triggered_at: h.clock.now(),
                size: Some(64),
                display_name: None,
                extension: Some("mp4".into()),
            },
        );
        h.drop_transfer_file("EVT-10", 64);

        let summary = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(summary.cameras, 1);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.ingested, 1);
        assert_eq!(summary.ingest_failed, 0);

        let events = h.engine.list_events(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].local_path.is_some());

        // A second pass finds nothing new to do
        let again = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.ingested, 0);
    }

    #[tokio::test]
    async fn unreachable_device_keeps_last_good_snapshot() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-1", 10).await;
        h.engine.get_presence(&event.id, true).await.unwrap();

        h.device.set_reachable(false);
        let presence = h.engine.get_presence(&event.id, true).await.unwrap();
        assert_eq!(presence.device, Presence::Unknown);

        let stored = h.engine.get_event(&event.id).await.unwrap();
        assert_eq!(stored.presence.device, Presence::Present);
        assert!(stored.device_deleted_at.is_none());
        assert!(stored.purged_at.is_none());
        assert_eq!(h.device.delete_calls(), 0);

        let summary = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(summary.devices_unreachable, 1);
    }

    #[tokio::test]
    async fn loose_transfer_file_becomes_one_orphan_after_grace() {
        let h = Harness::with_config(|c| c.ingest.auto_ingest = false).await;
        h.drop_transfer_file("LOOSE", 32);

        let first = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(first.orphaned, 0);

        h.clock.advance(Duration::seconds(121));
        let second = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(second.orphaned, 1);

        h.clock.advance(Duration::seconds(600));
        let third = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(third.orphaned, 0);

        let orphans = h
            .engine
            .list_events(&EventFilter {
                orphaned: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
    }

    #[tokio::test]
    async fn no_orphans_while_device_is_unreachable() {
        let h = Harness::with_config(|c| c.ingest.auto_ingest = false).await;
        h.device.set_reachable(false);
        h.drop_transfer_file("LOOSE", 32);

        h.engine.trigger_sync(None).await.unwrap();
        h.clock.advance(Duration::hours(1));
        let summary = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(summary.orphaned, 0);
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn unknown_camera_is_not_found() {
        let h = Harness::new().await;
        let err = h.engine.trigger_sync(Some(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn deleting_every_copy_purges_the_event() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-2", 16).await;
        h.drop_transfer_file("EVT-2", 16);
        h.engine.ingest(&event.id).await.unwrap();

        h.engine.request_delete_local(&event.id).await.unwrap();
        let stored = h.engine.get_event(&event.id).await.unwrap();
        assert!(stored.purged_at.is_none());

        h.remove_transfer_file("EVT-2", "mp4");
        h.engine.request_delete_from_device(&event.id).await.unwrap();
        let stored = h.engine.get_event(&event.id).await.unwrap();
        assert!(stored.purged_at.is_some());
        assert_eq!(
            LifecycleState::from_presence(&stored.presence, stored.orphaned),
            Some(LifecycleState::Purged)
        );
    }

    #[tokio::test]
    async fn unknown_presence_never_purges() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-3", 16).await;
        h.device.set_reachable(false);

        h.engine.request_delete_local(&event.id).await.unwrap();
        let stored = h.engine.get_event(&event.id).await.unwrap();
        assert!(stored.purged_at.is_none());
    }

    #[tokio::test]
    async fn presence_change_is_published() {
        let h = Harness::new().await;
        let mut rx = h.broker.subscribe();
        let event = h.device_event("EVT-4", 16).await;

        h.engine.get_presence(&event.id, true).await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.event_type, EventType::EventPresenceChanged);
        assert_eq!(message.source_id, Some(event.id));
        assert_eq!(message.payload["presence"]["device"], "present");
        assert_eq!(message.payload["state"], "camera_only");

        // Same presence again publishes nothing new
        h.engine.get_presence(&event.id, true).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingest_updates_snapshot_and_publishes() {
        let h = Harness::with_config(|c| c.ingest.auto_ingest = false).await;
        let event = h.device_event("EVT-5", 16).await;
        h.drop_transfer_file("EVT-5", 16);
        h.engine.get_presence(&event.id, true).await.unwrap();

        let mut rx = h.broker.subscribe();
        h.engine.ingest(&event.id).await.unwrap();

        let stored = h.engine.get_event(&event.id).await.unwrap();
        assert_eq!(
            stored.presence,
            PresenceVector::new(Presence::Present, Presence::Present, Presence::Present)
        );
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::EventIngested);
        let changed = rx.recv().await.unwrap();
        assert_eq!(changed.event_type, EventType::EventPresenceChanged);
        assert_eq!(changed.payload["presence"]["local"], "present");
    }

    #[tokio::test]
    async fn uppercase_extension_is_ingested_by_sync() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-UP", 48).await;
        h.drop_transfer_bytes("EVT-UP", "MP4", &[1u8; 48]);

        let presence = h.engine.get_presence(&event.id, true).await.unwrap();
        assert_eq!(presence.transfer, Presence::Present);

        let summary = h.engine.trigger_sync(None).await.unwrap();
        assert_eq!(summary.ingested, 1);
        let stored = h.engine.get_event(&event.id).await.unwrap();
        assert_eq!(stored.file_size, Some(48));
    }

    #[tokio::test]
    async fn stalled_transfer_does_not_block_the_sync_pass() {
        let h = Harness::with_config(|c| c.ingest.read_timeout_ms = 100).await;
        h.device_event("EVT-STUCK", 32).await;
        h.drop_transfer_file("EVT-STUCK", 32);
        h.transfer.set_stall_after(Some(std::time::Duration::from_secs(3600)));

        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            h.engine.trigger_sync(None),
        )
        .await
        .expect("sync pass must finish")
        .unwrap();
        assert_eq!(summary.ingested, 0);
        assert_eq!(summary.ingest_failed, 1);
        assert_eq!(h.ingest.in_flight(), 0);
    }

    #[tokio::test]
    async fn engine_shutdown_refuses_ingest() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-6", 16).await;
        h.drop_transfer_file("EVT-6", 16);
        h.engine.shutdown().await;

        let err = h.engine.ingest(&event.id).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn archived_file_is_read_from_the_archive() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-7", 16).await;
        let err = h.engine.archived_file(&event.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let path = h.archive_copy(&event, b"sixteen bytes!!!").await;
        let file = h.engine.archived_file(&event.id).await.unwrap();
        assert_eq!(file.path, path);
        assert_eq!(file.size, 16);
        assert_eq!(file.content_type, "video/mp4");
        assert_eq!(file.file_name, "EVT-7.mp4");

        std::fs::remove_file(&path).unwrap();
        assert!(h.engine.archived_file(&event.id).await.is_err());
        assert!(h.engine.thumbnail_file(&event.id).await.is_err());
    }
}
