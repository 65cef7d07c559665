//! Tri-store presence probing.
//!
//! Probes are read-only. Each store is asked independently under its own
//! timeout, and any failure degrades that component to `Unknown` instead of
//! being reported as an error.

use crate::config::{CameraConfig, ProbeConfig};
use crate::db::models::{Event, NativeKey};
use crate::error::{Error, Result};
use crate::stores::{ArchiveStore, CameraRegistry, DeviceRecord, DeviceStore, TransferStore};
use crate::sync::archive_path;
use crate::sync::cache::TtlCache;
use crate::sync::presence::{Presence, PresenceVector};
use crate::sync::retry::{retry, RetryConfig};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use uuid::Uuid;

pub struct SyncProber {
    registry: Arc<CameraRegistry>,
    device: Arc<dyn DeviceStore>,
    transfer: Arc<dyn TransferStore>,
    archive: Arc<dyn ArchiveStore>,
    /// Native keys each camera listed recently
    listings: TtlCache<Uuid, Arc<HashSet<NativeKey>>>,
    /// Presence per event id
    presence: TtlCache<Uuid, PresenceVector>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    call_timeout: Duration,
    device_retry: RetryConfig,
}

async fn bounded<T>(
    call_timeout: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(call_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeviceUnreachable(format!(
            "{} timed out after {:?}",
            what, call_timeout
        ))),
    }
}

impl SyncProber {
    pub fn new(
        config: &ProbeConfig,
        registry: Arc<CameraRegistry>,
        device: Arc<dyn DeviceStore>,
        transfer: Arc<dyn TransferStore>,
        archive: Arc<dyn ArchiveStore>,
    ) -> Self {
        let worker_count = config.worker_pool_size.max(1);
        Self {
            registry,
            device,
            transfer,
            archive,
            listings: TtlCache::new(config.cache_ttl()),
            presence: TtlCache::new(config.cache_ttl()),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            call_timeout: config.call_timeout(),
            device_retry: RetryConfig::device(config.device_retry_attempts),
        }
    }

    async fn list_with_retry(&self, camera: &CameraConfig) -> Result<Vec<DeviceRecord>> {
        let what = format!("listing events on {}", camera.name);
        retry(&what, &self.device_retry, Error::is_transient, || {
            bounded(self.call_timeout, &what, self.device.list_events(camera))
        })
        .await
    }

    fn remember_listing(&self, camera_id: Uuid, records: &[DeviceRecord]) -> Arc<HashSet<NativeKey>> {
        let keys: Arc<HashSet<NativeKey>> =
            Arc::new(records.iter().map(|r| r.native_key.clone()).collect());
        self.listings.put(camera_id, keys.clone());
        keys
    }

    /// Fetch a camera's listing, bounded by the call timeout and retried on
    /// transient failures. The listed keys are cached for later probes.
    pub async fn fetch_listing(&self, camera: &CameraConfig) -> Result<Vec<DeviceRecord>> {
        let records = self.list_with_retry(camera).await?;
        self.remember_listing(camera.id, &records);
        Ok(records)
    }

    async fn listed_keys(
        &self,
        camera: &CameraConfig,
        force: bool,
    ) -> Result<Arc<HashSet<NativeKey>>> {
        if !force {
            if let Some(keys) = self.listings.get(&camera.id) {
                return Ok(keys);
            }
        }
        let records = self.list_with_retry(camera).await?;
        Ok(self.remember_listing(camera.id, &records))
    }

    async fn probe_device(&self, camera: &CameraConfig, event: &Event, force: bool) -> Presence {
        match self.listed_keys(camera, force).await {
            Ok(keys) => Presence::from_exists(keys.contains(&event.native_key)),
            Err(e) => {
                warn!(
                    "Device presence of {} unknown: {}",
                    event.native_key, e
                );
                Presence::Unknown
            }
        }
    }

    async fn probe_transfer(&self, camera: &CameraConfig, event: &Event) -> Presence {
        let what = format!("locating {} in transfer store", event.native_key);
        match bounded(
            self.call_timeout,
            &what,
            self.transfer.locate(camera, &event.native_key),
        )
        .await
        {
            Ok(found) => Presence::from_exists(found.is_some()),
            Err(e) => {
                warn!("Transfer presence of {} unknown: {}", event.native_key, e);
                Presence::Unknown
            }
        }
    }

    async fn probe_local(&self, event: &Event) -> Presence {
        let Some(path) = archive_path(self.archive.as_ref(), event) else {
            return Presence::Absent;
        };
        let what = format!("checking archive copy {}", path.display());
        match bounded(self.call_timeout, &what, self.archive.size_of(&path)).await {
            Ok(size) => Presence::from_exists(size.map_or(false, |s| s > 0)),
            Err(e) => {
                warn!("Local presence of {} unknown: {}", event.native_key, e);
                Presence::Unknown
            }
        }
    }

    /// Compute the presence vector of one event. `force` bypasses both the
    /// presence cache and the device listing cache.
    pub async fn probe(&self, event: &Event, force: bool) -> PresenceVector {
        if !force {
            if let Some(cached) = self.presence.get(&event.id) {
                return cached;
            }
        }

        let camera = match self.registry.get(&event.camera_id) {
            Ok(camera) => camera,
            Err(e) => {
                warn!("Cannot probe event {}: {}", event.id, e);
                return PresenceVector::unknown();
            }
        };

        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => return PresenceVector::unknown(),
        };

        let (device, transfer, local) = tokio::join!(
            self.probe_device(camera, event, force),
            self.probe_transfer(camera, event),
            self.probe_local(event),
        );
        let vector = PresenceVector::new(device, transfer, local);
        debug!("Probed {} {}", event.native_key, vector);

        self.presence.put(event.id, vector);
        vector
    }

    /// Probe several events through the worker pool
    pub async fn probe_many(&self, events: &[Event], force: bool) -> Vec<(Uuid, PresenceVector)> {
        let probes: Vec<_> = events
            .iter()
            .cloned()
            .map(|event| async move {
                let vector = self.probe(&event, force).await;
                (event.id, vector)
            })
            .collect();

        stream::iter(probes)
            .buffer_unordered(self.worker_count)
            .collect()
            .await
    }

    /// Forget the cached presence of an event after a mutation
    pub fn invalidate(&self, event_id: &Uuid) {
        self.presence.invalidate(event_id);
    }

    pub fn invalidate_listing(&self, camera_id: &Uuid) {
        self.listings.invalidate(camera_id);
    }
}
