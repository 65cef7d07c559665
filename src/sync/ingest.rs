//! Moves event files from the transfer store into the archive.
//!
//! Ingest is single-flight per event: the work runs in a detached task and
//! every caller for the same event awaits one shared result. Dropping a
//! caller never aborts the task; only [`IngestPipeline::cancel`] or
//! [`IngestPipeline::shutdown`] does, and a cancelled task removes its
//! staging file before it returns. Every transfer call is bounded: a read
//! that makes no progress within the read timeout fails the attempt.

use crate::config::IngestConfig;
use crate::db::models::{ArchivedCopy, Event};
use crate::db::repositories::EventStore;
use crate::error::{Error, Result};
use crate::stores::{
    content_type_for, ArchiveStore, ByteStream, CameraRegistry, StagedFile, TransferFile,
    TransferStore,
};
use crate::sync::clock::Clock;
use crate::sync::locks::KeyedLocks;
use crate::sync::retry::RetryConfig;
use crate::sync::thumbnail::{generate_thumbnail, is_thumbnailable};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::time::{sleep, timeout, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

type SharedIngest = Shared<BoxFuture<'static, Result<ArchivedCopy>>>;
type InFlightTable = Arc<Mutex<HashMap<Uuid, InFlight>>>;

struct InFlight {
    result: SharedIngest,
    cancel: CancellationToken,
}

/// Removes the in-flight entry when the ingest task ends, even by panic
struct InFlightEntry {
    table: InFlightTable,
    event_id: Uuid,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.event_id);
    }
}

/// Fails a read that stays pending for longer than `limit`
struct IdleTimeoutReader {
    inner: ByteStream,
    limit: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl IdleTimeoutReader {
    fn wrap(inner: ByteStream, limit: Duration) -> ByteStream {
        Box::new(Self {
            inner,
            limit,
            deadline: Box::pin(tokio::time::sleep(limit)),
        })
    }
}

impl AsyncRead for IdleTimeoutReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                let next = Instant::now() + self.limit;
                self.deadline.as_mut().reset(next);
                Poll::Ready(result)
            }
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data for {:?}", self.limit),
                ))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

pub struct IngestPipeline {
    worker: Arc<IngestWorker>,
    in_flight: InFlightTable,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

struct IngestWorker {
    registry: Arc<CameraRegistry>,
    store: Arc<dyn EventStore>,
    transfer: Arc<dyn TransferStore>,
    archive: Arc<dyn ArchiveStore>,
    locks: Arc<KeyedLocks<Uuid>>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    read_timeout: Duration,
    thumbnail_max_dimension: u32,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &IngestConfig,
        thumbnail_max_dimension: u32,
        registry: Arc<CameraRegistry>,
        store: Arc<dyn EventStore>,
        transfer: Arc<dyn TransferStore>,
        archive: Arc<dyn ArchiveStore>,
        locks: Arc<KeyedLocks<Uuid>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker: Arc::new(IngestWorker {
                registry,
                store,
                transfer,
                archive,
                locks,
                clock,
                retry: RetryConfig::ingest(config),
                read_timeout: config.read_timeout(),
                thumbnail_max_dimension,
            }),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Ingest one event, joining an ingest already running for it
    pub async fn ingest(&self, event_id: &Uuid) -> Result<ArchivedCopy> {
        let event_id = *event_id;
        let result = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(&event_id) {
                Some(running) => {
                    debug!("Joining in-flight ingest of event {}", event_id);
                    running.result.clone()
                }
                None => {
                    if self.shutdown.is_cancelled() {
                        return Err(Error::Cancelled("ingest pipeline is shut down".into()));
                    }

                    let cancel = self.shutdown.child_token();
                    let worker = self.worker.clone();
                    let entry = InFlightEntry {
                        table: self.in_flight.clone(),
                        event_id,
                    };
                    let token = cancel.clone();
                    let handle = self.tasks.spawn(async move {
                        let _entry = entry;
                        worker.run(event_id, token).await
                    });

                    let result: SharedIngest = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(Error::Internal(format!("Ingest task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(
                        event_id,
                        InFlight {
                            result: result.clone(),
                            cancel,
                        },
                    );
                    result
                }
            }
        };

        result.await
    }

    /// Abort the running ingest of an event. Returns false when none runs.
    pub fn cancel(&self, event_id: &Uuid) -> bool {
        match self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_id)
        {
            Some(running) => {
                info!("Cancelling ingest of event {}", event_id);
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Cancel every running ingest, refuse new ones and wait until the
    /// cancelled tasks have cleaned up their staging files
    pub async fn shutdown(&self) {
        info!("Shutting down ingest pipeline ({} in flight)", self.in_flight());
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Ingest pipeline stopped");
    }
}

impl IngestWorker {
    async fn run(&self, event_id: Uuid, cancel: CancellationToken) -> Result<ArchivedCopy> {
        let _guard = tokio::select! {
            guard = self.locks.lock(event_id) => guard,
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("ingest of {} cancelled", event_id)));
            }
        };

        let event = self
            .store
            .get(&event_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Event {} not found", event_id)))?;

        if let Some(copy) = self.existing_copy(&event).await? {
            debug!("Event {} is already archived", event.id);
            return Ok(copy);
        }

        match self.transfer_with_retry(&event, &cancel).await {
            Ok(copy) => Ok(copy),
            Err(Error::Cancelled(reason)) => {
                info!("Ingest of event {} cancelled", event.id);
                Err(Error::Cancelled(reason))
            }
            Err(e) => {
                if let Err(record_err) = self.store.record_ingest_error(&event.id, &e.to_string()).await {
                    error!(
                        "Failed to record ingest error for event {}: {}",
                        event.id, record_err
                    );
                }
                Err(e)
            }
        }
    }

    /// The archived copy, when the recorded file is in place with the
    /// recorded size
    async fn existing_copy(&self, event: &Event) -> Result<Option<ArchivedCopy>> {
        let (Some(path), Some(size)) = (&event.local_path, event.file_size) else {
            return Ok(None);
        };
        if self.archive.size_of(path).await? != Some(size) {
            return Ok(None);
        }

        Ok(Some(ArchivedCopy {
            event_id: event.id,
            local_path: path.clone(),
            file_size: size,
            content_type: event
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            thumbnail_path: event.thumbnail_path.clone(),
        }))
    }

    /// Run one transfer store call under the read timeout
    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.read_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransferRead(format!(
                "{} timed out after {:?}",
                what, self.read_timeout
            ))),
        }
    }

    async fn open(&self, file: &TransferFile) -> Result<ByteStream> {
        let what = format!("opening {}", file.path.display());
        let reader = self.bounded(&what, self.transfer.open(file)).await?;
        Ok(IdleTimeoutReader::wrap(reader, self.read_timeout))
    }

    async fn stage_once(&self, file: &TransferFile, target: &Path) -> Result<StagedFile> {
        let mut reader = self.open(file).await?;
        self.archive.stage(target, &mut reader).await
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = self.archive.discard(path).await {
            warn!("Failed to remove staging file {}: {}", path.display(), e);
        }
    }

    async fn transfer_with_retry(
        &self,
        event: &Event,
        cancel: &CancellationToken,
    ) -> Result<ArchivedCopy> {
        let camera = self.registry.get(&event.camera_id)?;
        let max_attempts = self.retry.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let what = format!("locating {}", event.native_key);
            let file = self
                .bounded(&what, self.transfer.locate(camera, &event.native_key))
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "No transfer file for {} on {}",
                        event.native_key, camera.name
                    ))
                })?;
            let target = self
                .archive
                .path_for(&event.camera_id, &event.native_key, &file.extension);
            let staging = self.archive.staging_path(&target);

            let staged = tokio::select! {
                staged = self.stage_once(&file, &target) => staged,
                _ = cancel.cancelled() => {
                    self.discard(&staging).await;
                    return Err(Error::Cancelled(format!("ingest of {} cancelled", event.id)));
                }
            };

            match staged {
                Ok(staged) if staged.bytes_written == file.size => {
                    if let Err(e) = self.archive.commit(&staged, &target).await {
                        self.discard(&staged.path).await;
                        return Err(e);
                    }
                    return self.finish(event, &file, target, staged.bytes_written).await;
                }
                Ok(staged) => {
                    let reason = format!(
                        "{} staged {} bytes but the transfer store reported {}",
                        event.native_key, staged.bytes_written, file.size
                    );
                    if attempt >= max_attempts {
                        match self.archive.quarantine(&staged, &event.id).await {
                            Ok(path) => error!(
                                "Integrity mismatch for event {}, kept staged file at {}",
                                event.id,
                                path.display()
                            ),
                            Err(e) => error!(
                                "Integrity mismatch for event {}, quarantine failed: {}",
                                event.id, e
                            ),
                        }
                        return Err(Error::IntegrityMismatch(reason));
                    }
                    self.discard(&staged.path).await;
                    warn!(
                        "Attempt {}/{} for event {}: {}",
                        attempt, max_attempts, event.id, reason
                    );
                }
                Err(e) => {
                    self.discard(&staging).await;
                    if !e.is_transient() || attempt >= max_attempts {
                        return Err(e);
                    }
                    warn!(
                        "Attempt {}/{} for event {} failed: {}",
                        attempt, max_attempts, event.id, e
                    );
                }
            }

            let delay = self.retry.delay_after(attempt);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("ingest of {} cancelled", event.id)));
                }
            }
        }
    }

    async fn finish(
        &self,
        event: &Event,
        file: &TransferFile,
        target: PathBuf,
        file_size: u64,
    ) -> Result<ArchivedCopy> {
        let content_type = content_type_for(&file.extension);
        let thumbnail_path = if is_thumbnailable(content_type) {
            self.thumbnail(event, file).await
        } else {
            None
        };

        let copy = ArchivedCopy {
            event_id: event.id,
            local_path: target,
            file_size,
            content_type: content_type.to_string(),
            thumbnail_path,
        };
        self.store.record_archived(&copy, self.clock.now()).await?;

        info!(
            "Ingested event {} ({}, {} bytes) into {}",
            event.id,
            event.native_key,
            file_size,
            copy.local_path.display()
        );
        Ok(copy)
    }

    /// Best effort; a failed thumbnail never fails the ingest
    async fn thumbnail(&self, event: &Event, file: &TransferFile) -> Option<PathBuf> {
        let path = self
            .archive
            .thumbnail_path_for(&event.camera_id, &event.native_key);

        let result: Result<()> = async {
            let mut reader = self.open(file).await?;
            let mut data = Vec::with_capacity(file.size as usize);
            reader
                .read_to_end(&mut data)
                .await
                .map_err(|e| Error::TransferRead(e.to_string()))?;
            let jpeg = generate_thumbnail(data, self.thumbnail_max_dimension).await?;
            self.archive.write(&path, &jpeg).await
        }
        .await;

        match result {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Thumbnail for event {} failed: {}", event.id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::presence::Presence;
    use crate::sync::testing::Harness;
    use std::time::Duration;

    #[tokio::test]
    async fn ingest_archives_with_matching_size() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-0005", 2048).await;
        h.drop_transfer_file("EVT-0005", 2048);

        let copy = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(copy.file_size, 2048);
        assert_eq!(copy.content_type, "video/mp4");
        assert!(copy.thumbnail_path.is_none());
        assert_eq!(std::fs::metadata(&copy.local_path).unwrap().len(), 2048);

        let stored = h.store.get(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.local_path, Some(copy.local_path.clone()));
        assert!(stored.ingested_at.is_some());
        assert!(stored.ingest_error.is_none());

        let presence = h.prober.probe(&stored, true).await;
        assert_eq!(presence.local, Presence::Present);
        // The transfer copy is never removed by ingest
        assert_eq!(presence.transfer, Presence::Present);
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_transfer() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-1", 4096).await;
        h.drop_transfer_file("EVT-1", 4096);
        h.transfer.set_stall_after(Some(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ingest = h.ingest.clone();
            let id = event.id;
            handles.push(tokio::spawn(async move { ingest.ingest(&id).await }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.transfer.opens(), 1);
        assert_eq!(h.ingest.in_flight(), 0);
    }

    #[tokio::test]
    async fn rerun_on_archived_event_is_a_no_op() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-2", 128).await;
        h.drop_transfer_file("EVT-2", 128);

        let first = h.ingest.ingest(&event.id).await.unwrap();
        let opens = h.transfer.opens();
        let second = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.transfer.opens(), opens);
    }

    #[tokio::test]
    async fn transient_read_errors_are_retried() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-3", 256).await;
        h.drop_transfer_file("EVT-3", 256);
        h.transfer.fail_next_reads(2);

        let copy = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(copy.file_size, 256);
        assert_eq!(h.transfer.opens(), 3);
    }

    #[tokio::test]
    async fn read_errors_beyond_budget_are_returned() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-4", 256).await;
        h.drop_transfer_file("EVT-4", 256);
        h.transfer.fail_next_reads(10);

        let err = h.ingest.ingest(&event.id).await.unwrap_err();
        assert!(matches!(err, Error::TransferRead(_)));

        let stored = h.store.get(&event.id).await.unwrap().unwrap();
        assert!(stored.ingest_error.is_some());
        assert!(stored.local_path.is_none());
    }

    #[tokio::test]
    async fn persistent_size_mismatch_quarantines() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-5", 1000).await;
        h.drop_transfer_file("EVT-5", 1000);
        h.transfer.set_short_reads(Some(600));

        let err = h.ingest.ingest(&event.id).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch(_)));

        let quarantined: Vec<_> = std::fs::read_dir(h.quarantine_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(std::fs::metadata(&quarantined[0]).unwrap().len(), 600);

        let stored = h.store.get(&event.id).await.unwrap().unwrap();
        assert!(stored
            .ingest_error
            .as_deref()
            .unwrap()
            .contains("Integrity mismatch"));
        let presence = h.prober.probe(&stored, true).await;
        assert_eq!(presence.local, Presence::Absent);
        assert_eq!(presence.transfer, Presence::Present);
    }

    #[tokio::test]
    async fn mismatch_that_settles_succeeds() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-6", 1000).await;
        h.drop_transfer_file("EVT-6", 1000);
        h.transfer.set_short_reads_for(Some(400), 1);

        let copy = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(copy.file_size, 1000);
        assert!(!h.quarantine_dir().exists());
    }

    #[tokio::test]
    async fn cancel_cleans_up_staging() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-7", 4096).await;
        h.drop_transfer_file("EVT-7", 4096);
        h.transfer.set_stall_after(Some(Duration::from_secs(30)));

        let ingest = h.ingest.clone();
        let id = event.id;
        let task = tokio::spawn(async move { ingest.ingest(&id).await });

        let target = h.archive.path_for(&event.camera_id, &event.native_key, "mp4");
        let staging = h.archive.staging_path(&target);
        for _ in 0..100 {
            if staging.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(staging.exists());

        assert!(h.ingest.cancel(&event.id));
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!staging.exists());
        assert!(!target.exists());

        let stored = h.store.get(&event.id).await.unwrap().unwrap();
        assert!(stored.local_path.is_none());
        assert!(stored.ingest_error.is_none());
    }

    #[tokio::test]
    async fn dropped_caller_does_not_abort_ingest() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-8", 512).await;
        h.drop_transfer_file("EVT-8", 512);
        h.transfer.set_stall_after(Some(Duration::from_millis(100)));

        let abandoned = tokio::time::timeout(Duration::from_millis(10), h.ingest.ingest(&event.id)).await;
        assert!(abandoned.is_err());

        // A later caller joins the task that kept running
        let copy = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(copy.file_size, 512);
        assert_eq!(h.transfer.opens(), 1);
    }

    #[tokio::test]
    async fn snapshots_get_thumbnails() {
        let h = Harness::new().await;
        let png = crate::sync::thumbnail::sample_png(640, 480);
        let event = h.device_event_with_ext("SNAP-1", png.len() as u64, "png").await;
        h.drop_transfer_bytes("SNAP-1", "png", &png);

        let copy = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(copy.content_type, "image/png");
        let thumb = copy.thumbnail_path.expect("thumbnail");
        let img = image::open(&thumb).unwrap();
        assert_eq!(img.width(), h.config.archive.thumbnail_max_dimension);
    }

    #[tokio::test]
    async fn broken_image_still_ingests() {
        let h = Harness::new().await;
        let event = h.device_event_with_ext("SNAP-2", 32, "jpg").await;
        h.drop_transfer_bytes("SNAP-2", "jpg", &[7u8; 32]);

        let copy = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(copy.file_size, 32);
        assert!(copy.thumbnail_path.is_none());
    }

    #[tokio::test]
    async fn missing_transfer_file_is_not_found() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-9", 10).await;
        let err = h.ingest.ingest(&event.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-10", 10).await;
        h.drop_transfer_file("EVT-10", 10);
        h.ingest.shutdown().await;

        let err = h.ingest.ingest(&event.id).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn stalled_read_times_out_and_is_retried() {
        let h = Harness::with_config(|c| c.ingest.read_timeout_ms = 100).await;
        let event = h.device_event("EVT-11", 64).await;
        h.drop_transfer_file("EVT-11", 64);
        h.transfer.set_stall_after(Some(Duration::from_secs(3600)));

        let started = std::time::Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(5), h.ingest.ingest(&event.id))
            .await
            .expect("stalled ingest must give up")
            .unwrap_err();
        assert!(matches!(err, Error::TransferRead(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(h.transfer.opens(), h.config.ingest.max_attempts);

        let target = h.archive.path_for(&event.camera_id, &event.native_key, "mp4");
        assert!(!h.archive.staging_path(&target).exists());
        let stored = h.store.get(&event.id).await.unwrap().unwrap();
        assert!(stored.ingest_error.is_some());
    }

    #[tokio::test]
    async fn stall_that_clears_within_timeout_succeeds() {
        let h = Harness::with_config(|c| c.ingest.read_timeout_ms = 500).await;
        let event = h.device_event("EVT-12", 64).await;
        h.drop_transfer_file("EVT-12", 64);
        h.transfer.set_stall_after(Some(Duration::from_millis(50)));

        let copy = h.ingest.ingest(&event.id).await.unwrap();
        assert_eq!(copy.file_size, 64);
        assert_eq!(h.transfer.opens(), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_cancelled_ingest_to_clean_up() {
        let h = Harness::new().await;
        let event = h.device_event("EVT-13", 4096).await;
        h.drop_transfer_file("EVT-13", 4096);
        h.transfer.set_stall_after(Some(Duration::from_secs(30)));

        let ingest = h.ingest.clone();
        let id = event.id;
        let task = tokio::spawn(async move { ingest.ingest(&id).await });

        let target = h.archive.path_for(&event.camera_id, &event.native_key, "mp4");
        let staging = h.archive.staging_path(&target);
        for _ in 0..100 {
            if staging.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(staging.exists());

        h.ingest.shutdown().await;
        // The detached task has finished its cleanup before shutdown returns
        assert!(!staging.exists());
        assert_eq!(h.ingest.in_flight(), 0);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
