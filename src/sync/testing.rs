//! Fakes and a wired engine for the sync tests.

use crate::config::{CameraConfig, Config};
use crate::db::models::{ArchivedCopy, Event, NativeKey};
use crate::db::repositories::{EventStore, MemoryEventsRepository};
use crate::error::{Error, Result};
use crate::messaging::{EventNotifier, LocalBroker};
use crate::stores::{
    content_type_for, ArchiveStore, ByteStream, DeviceRecord, DeviceStore, FsArchiveStore, FsTransferStore,
    TransferFile, TransferStore,
};
use crate::sync::clock::{Clock, ManualClock};
use crate::sync::deletion::DeletionCoordinator;
use crate::sync::engine::SyncEngine;
use crate::sync::ingest::IngestPipeline;
use crate::sync::prober::SyncProber;
use crate::sync::resolver::EventResolver;
use crate::sync::retention::RetentionSweeper;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::time::Sleep;
use url::Url;
use uuid::Uuid;

/// Scripted device: listing per camera, reachability switch, latency and a
/// log of deletes
#[derive(Default)]
pub struct FakeDevice {
    records: Mutex<HashMap<Uuid, Vec<DeviceRecord>>>,
    unreachable: AtomicBool,
    delay_ms: AtomicU64,
    camera_delays: Mutex<HashMap<Uuid, Duration>>,
    list_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    deleted: Mutex<Vec<NativeKey>>,
}

impl FakeDevice {
    pub fn add_record(&self, camera_id: Uuid, record: DeviceRecord) {
        self.records
            .lock()
            .unwrap()
            .entry(camera_id)
            .or_default()
            .push(record);
    }

    /// Drop a record without going through delete, as if the device
    /// rotated it out
    pub fn forget(&self, key: &str) {
        for records in self.records.lock().unwrap().values_mut() {
            records.retain(|r| r.native_key.as_str() != key);
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Latency for one camera only
    pub fn set_camera_delay(&self, camera_id: Uuid, delay: Duration) {
        self.camera_delays.lock().unwrap().insert(camera_id, delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<NativeKey> {
        self.deleted.lock().unwrap().clone()
    }

    async fn answer(&self, camera: &CameraConfig) -> Result<()> {
        let delay = self
            .camera_delays
            .lock()
            .unwrap()
            .get(&camera.id)
            .copied()
            .unwrap_or_else(|| Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnreachable(format!(
                "{} is offline",
                camera.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for FakeDevice {
    async fn list_events(&self, camera: &CameraConfig) -> Result<Vec<DeviceRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(camera).await?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&camera.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_event(&self, camera: &CameraConfig, native_key: &NativeKey) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(camera).await?;

        let mut records = self.records.lock().unwrap();
        let list = records.entry(camera.id).or_default();
        let before = list.len();
        list.retain(|r| &r.native_key != native_key);
        if list.len() == before {
            return Err(Error::NotFound(format!("{} not on device", native_key)));
        }
        self.deleted.lock().unwrap().push(native_key.clone());
        Ok(())
    }
}

/// Waits before handing out any bytes
struct StalledReader {
    delay: Pin<Box<Sleep>>,
    inner: ByteStream,
}

impl AsyncRead for StalledReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.delay.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Real filesystem transfer store with injectable read faults
pub struct FlakyTransfer {
    inner: FsTransferStore,
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    /// Byte limit per open and how many more opens it applies to
    short_reads: Mutex<Option<(u64, Option<usize>)>>,
    stall: Mutex<Option<Duration>>,
}

impl FlakyTransfer {
    pub fn new(inner: FsTransferStore) -> Self {
        Self {
            inner,
            opens: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
            short_reads: Mutex::new(None),
            stall: Mutex::new(None),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Truncate every read to `limit` bytes
    pub fn set_short_reads(&self, limit: Option<u64>) {
        *self.short_reads.lock().unwrap() = limit.map(|l| (l, None));
    }

    /// Truncate the next `opens` reads to `limit` bytes
    pub fn set_short_reads_for(&self, limit: Option<u64>, opens: usize) {
        *self.short_reads.lock().unwrap() = limit.map(|l| (l, Some(opens)));
    }

    pub fn set_stall_after(&self, stall: Option<Duration>) {
        *self.stall.lock().unwrap() = stall;
    }

    fn take_short_read(&self) -> Option<u64> {
        let mut short = self.short_reads.lock().unwrap();
        match *short {
            Some((limit, None)) => Some(limit),
            Some((limit, Some(remaining))) => {
                *short = if remaining > 1 {
                    Some((limit, Some(remaining - 1)))
                } else {
                    None
                };
                Some(limit)
            }
            None => None,
        }
    }
}

#[async_trait]
impl TransferStore for FlakyTransfer {
    async fn list(&self, camera: &CameraConfig) -> Result<Vec<TransferFile>> {
        self.inner.list(camera).await
    }

    async fn locate(
        &self,
        camera: &CameraConfig,
        native_key: &NativeKey,
    ) -> Result<Option<TransferFile>> {
        self.inner.locate(camera, native_key).await
    }

    async fn open(&self, file: &TransferFile) -> Result<ByteStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(Error::TransferRead(format!(
                "injected read failure on {}",
                file.path.display()
            )));
        }

        let mut stream = self.inner.open(file).await?;
        if let Some(limit) = self.take_short_read() {
            stream = Box::new(stream.take(limit));
        }
        let stall = *self.stall.lock().unwrap();
        if let Some(delay) = stall {
            stream = Box::new(StalledReader {
                delay: Box::pin(tokio::time::sleep(delay)),
                inner: stream,
            });
        }
        Ok(stream)
    }
}

/// A sync engine over temp dirs, an in-memory event store, a fake device
/// and a manual clock
pub struct Harness {
    pub config: Config,
    pub camera: CameraConfig,
    pub engine: Arc<SyncEngine>,
    pub prober: Arc<SyncProber>,
    pub resolver: Arc<EventResolver>,
    pub ingest: Arc<IngestPipeline>,
    pub deletion: Arc<DeletionCoordinator>,
    pub retention: Arc<RetentionSweeper>,
    pub store: Arc<MemoryEventsRepository>,
    pub device: Arc<FakeDevice>,
    pub transfer: Arc<FlakyTransfer>,
    pub archive: Arc<FsArchiveStore>,
    pub clock: Arc<ManualClock>,
    pub broker: Arc<LocalBroker>,
    _tmp: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let camera = CameraConfig {
            id: Uuid::new_v4(),
            name: "cam1".into(),
            base_url: Url::parse("http://192.168.86.33").unwrap(),
            transfer_dir: Some("cam1".into()),
        };

        let mut config = Config::default();
        config.cameras = vec![camera.clone()];
        config.transfer.root = tmp.path().join("transfer");
        config.archive.root = tmp.path().join("archive");
        config.archive.thumbnail_max_dimension = 160;
        config.probe.call_timeout_ms = 200;
        config.probe.device_retry_attempts = 2;
        config.probe.cache_ttl_secs = 5;
        config.ingest.initial_backoff_ms = 10;
        config.ingest.max_backoff_ms = 50;
        config.ingest.max_attempts = 3;
        config.resolver.orphan_grace_secs = 120;
        adjust(&mut config);

        std::fs::create_dir_all(config.transfer.root.join("cam1")).unwrap();

        let store = Arc::new(MemoryEventsRepository::new());
        let device = Arc::new(FakeDevice::default());
        let transfer = Arc::new(FlakyTransfer::new(FsTransferStore::new(&config.transfer)));
        let archive = Arc::new(FsArchiveStore::new(&config.archive));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let broker = Arc::new(LocalBroker::default());

        let engine = Arc::new(SyncEngine::new(
            &config,
            store.clone(),
            device.clone(),
            transfer.clone(),
            archive.clone(),
            clock.clone(),
            EventNotifier::new(broker.clone()),
        ));

        Self {
            prober: engine.prober().clone(),
            resolver: engine.resolver().clone(),
            ingest: engine.ingest_pipeline().clone(),
            deletion: engine.deletion().clone(),
            retention: engine.retention().clone(),
            engine,
            config,
            camera,
            store,
            device,
            transfer,
            archive,
            clock,
            broker,
            _tmp: tmp,
        }
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.config.archive.quarantine_dir()
    }

    pub fn transfer_path(&self, key: &str, ext: &str) -> PathBuf {
        self.config
            .transfer
            .root
            .join("cam1")
            .join(format!("{}.{}", key, ext))
    }

    /// Record a device event triggered now and resolve it
    pub async fn device_event(&self, key: &str, size: u64) -> Event {
        self.device_event_with_ext(key, size, "mp4").await
    }

    pub async fn device_event_with_ext(&self, key: &str, size: u64, ext: &str) -> Event {
        self.device_event_at(key, size, ext, self.clock.now()).await
    }

    pub async fn device_event_at(
        &self,
        key: &str,
        size: u64,
        ext: &str,
        triggered_at: DateTime<Utc>,
    ) -> Event {
        let record = DeviceRecord {
            native_key: key.into(),
            triggered_at,
            size: Some(size),
            display_name: Some(format!("motion {}", key)),
            extension: Some(ext.to_string()),
        };
        self.device.add_record(self.camera.id, record.clone());
        self.resolver
            .resolve_device_record(self.camera.id, &record)
            .await
            .unwrap()
            .into_event()
            .unwrap()
    }

    /// Push a `size`-byte mp4 into the camera's transfer directory
    pub fn drop_transfer_file(&self, key: &str, size: u64) {
        self.drop_transfer_bytes(key, "mp4", &vec![0x42u8; size as usize]);
    }

    pub fn drop_transfer_bytes(&self, key: &str, ext: &str, bytes: &[u8]) {
        std::fs::write(self.transfer_path(key, ext), bytes).unwrap();
    }

    pub fn remove_transfer_file(&self, key: &str, ext: &str) {
        std::fs::remove_file(self.transfer_path(key, ext)).unwrap();
    }

    /// Place and record an archive copy directly, bypassing ingest
    pub async fn archive_copy(&self, event: &Event, bytes: &[u8]) -> PathBuf {
        let ext = event.extension.as_deref().unwrap_or("mp4");
        let path = self.archive.path_for(&event.camera_id, &event.native_key, ext);
        self.archive.write(&path, bytes).await.unwrap();
        let copy = ArchivedCopy {
            event_id: event.id,
            local_path: path.clone(),
            file_size: bytes.len() as u64,
            content_type: content_type_for(ext).to_string(),
            thumbnail_path: None,
        };
        self.store.record_archived(&copy, self.clock.now()).await.unwrap();
        path
    }
}
