//! Maps device records and transfer files onto canonical event rows.

use crate::db::models::{Event, EventCategory, NativeKey, NewEvent};
use crate::db::repositories::EventStore;
use crate::error::Result;
use crate::stores::{DeviceRecord, TransferFile};
use crate::sync::clock::Clock;
use crate::sync::locks::KeyedLocks;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

type CorrelationKey = (Uuid, NativeKey);

/// Outcome of resolving one observation
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A row for the key already existed
    Existing(Event),
    /// A new row was created
    Created(Event),
    /// An orphan row gained its device record
    Adopted(Event),
    /// A transfer file without a device record that is still inside its
    /// grace period, or whose device could not be listed
    Pending,
}

impl Resolution {
    pub fn event(&self) -> Option<&Event> {
        match self {
            Resolution::Existing(e) | Resolution::Created(e) | Resolution::Adopted(e) => Some(e),
            Resolution::Pending => None,
        }
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            Resolution::Existing(e) | Resolution::Created(e) | Resolution::Adopted(e) => Some(e),
            Resolution::Pending => None,
        }
    }
}

pub struct EventResolver {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
    /// Serializes lookup-then-insert per correlation key
    locks: KeyedLocks<CorrelationKey>,
    /// When each unmatched transfer file was first seen
    first_seen: Mutex<HashMap<CorrelationKey, DateTime<Utc>>>,
}

impl EventResolver {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>, orphan_grace_secs: u64) -> Self {
        Self {
            store,
            clock,
            grace: Duration::seconds(orphan_grace_secs as i64),
            locks: KeyedLocks::new(),
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    fn forget(&self, key: &CorrelationKey) {
        self.first_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// First observation time of an unmatched file, recording `now` if new
    fn observed_since(&self, key: &CorrelationKey, now: DateTime<Utc>) -> DateTime<Utc> {
        *self
            .first_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_insert(now)
    }

    /// Resolve a record from a device listing. Creates the row on first
    /// sight and adopts an orphan created earlier for the same key.
    pub async fn resolve_device_record(
        &self,
        camera_id: Uuid,
        record: &DeviceRecord,
    ) -> Result<Resolution> {
        let key = (camera_id, record.native_key.clone());
        let _guard = self.locks.lock(key.clone()).await;
        self.forget(&key);

        if let Some(existing) = self.store.find_by_key(&camera_id, &record.native_key).await? {
            if existing.orphaned {
                let adopted = self
                    .store
                    .adopt_orphan(&existing.id, record.triggered_at, record.display_name.clone())
                    .await?;
                info!(
                    "Adopted orphan event {} ({}) after its device record appeared",
                    adopted.id, adopted.native_key
                );
                return Ok(Resolution::Adopted(adopted));
            }
            return Ok(Resolution::Existing(existing));
        }

        let created = self
            .store
            .insert(NewEvent {
                camera_id,
                native_key: record.native_key.clone(),
                display_name: record.display_name.clone(),
                category: EventCategory::from_extension(record.extension.as_deref()),
                triggered_at: record.triggered_at,
                extension: record.extension.clone(),
                orphaned: false,
            })
            .await?;
        debug!("Created event {} for {}", created.id, created.native_key);

        Ok(Resolution::Created(created))
    }

    /// Resolve a file found in the transfer store.
    ///
    /// A file matching no row becomes an orphan only once it has been
    /// observed for the grace period and only when `device_listed` is true,
    /// meaning the camera's listing was fetched in this pass and did not
    /// contain the key.
    pub async fn resolve_transfer_file(
        &self,
        camera_id: Uuid,
        file: &TransferFile,
        device_listed: bool,
    ) -> Result<Resolution> {
        let key = (camera_id, file.native_key.clone());
        let _guard = self.locks.lock(key.clone()).await;

        if let Some(existing) = self.store.find_by_key(&camera_id, &file.native_key).await? {
            self.forget(&key);
            return Ok(Resolution::Existing(existing));
        }

        let now = self.clock.now();
        let since = self.observed_since(&key, now);
        if !device_listed || now - since < self.grace {
            return Ok(Resolution::Pending);
        }

        let created = self
            .store
            .insert(NewEvent {
                camera_id,
                native_key: file.native_key.clone(),
                display_name: None,
                category: EventCategory::from_extension(Some(&file.extension)),
                triggered_at: file.modified,
                extension: Some(file.extension.clone()),
                orphaned: true,
            })
            .await?;
        self.forget(&key);
        info!(
            "Created orphan event {} for transfer file {}",
            created.id,
            file.path.display()
        );

        Ok(Resolution::Created(created))
    }

    /// Drop grace bookkeeping for files of `camera_id` no longer present
    pub fn retain_observed(&self, camera_id: Uuid, present: &HashSet<NativeKey>) {
        self.first_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(camera, key), _| *camera != camera_id || present.contains(key));
    }

    /// Number of unmatched files waiting out their grace period
    pub fn pending_count(&self) -> usize {
        self.first_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::MemoryEventsRepository;
    use crate::sync::clock::ManualClock;
    use std::path::PathBuf;

    struct Fixture {
        store: Arc<MemoryEventsRepository>,
        clock: Arc<ManualClock>,
        resolver: Arc<EventResolver>,
    }

    fn fixture(grace_secs: u64) -> Fixture {
        let store = Arc::new(MemoryEventsRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let resolver = Arc::new(EventResolver::new(store.clone(), clock.clone(), grace_secs));
        Fixture {
            store,
            clock,
            resolver,
        }
    }

    fn record(key: &str) -> DeviceRecord {
        DeviceRecord {
            native_key: key.into(),
            triggered_at: Utc::now(),
            size: Some(100),
            display_name: Some("motion".into()),
            extension: Some("mp4".into()),
        }
    }

    fn transfer_file(key: &str) -> TransferFile {
        TransferFile {
            native_key: key.into(),
            path: PathBuf::from(format!("/transfer/cam/{}.mp4", key)),
            extension: "mp4".into(),
            size: 100,
            modified: Utc::now() - Duration::minutes(3),
        }
    }

    #[tokio::test]
    async fn device_and_transfer_share_identity() {
        let f = fixture(120);
        let camera = Uuid::new_v4();

        let from_device = f
            .resolver
            .resolve_device_record(camera, &record("EVT-0005"))
            .await
            .unwrap();
        assert!(matches!(from_device, Resolution::Created(_)));

        let from_transfer = f
            .resolver
            .resolve_transfer_file(camera, &transfer_file("EVT-0005"), true)
            .await
            .unwrap();
        assert_eq!(
            from_transfer.event().map(|e| e.id),
            from_device.event().map(|e| e.id)
        );
    }

    #[tokio::test]
    async fn concurrent_resolution_creates_one_row() {
        let f = fixture(120);
        let camera = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let resolver = f.resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve_device_record(camera, &record("EVT-1"))
                    .await
                    .unwrap()
                    .into_event()
                    .unwrap()
                    .id
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn orphan_after_grace_exactly_once() {
        let f = fixture(120);
        let camera = Uuid::new_v4();
        let file = transfer_file("LOOSE-1");

        let first = f.resolver.resolve_transfer_file(camera, &file, true).await.unwrap();
        assert_eq!(first, Resolution::Pending);
        assert_eq!(f.resolver.pending_count(), 1);

        f.clock.advance(Duration::seconds(60));
        let still = f.resolver.resolve_transfer_file(camera, &file, true).await.unwrap();
        assert_eq!(still, Resolution::Pending);

        f.clock.advance(Duration::seconds(61));
        let orphan = f.resolver.resolve_transfer_file(camera, &file, true).await.unwrap();
        let orphan = match orphan {
            Resolution::Created(e) => e,
            other => panic!("expected orphan, got {:?}", other),
        };
        assert!(orphan.orphaned);
        assert_eq!(orphan.triggered_at, file.modified);

        let again = f.resolver.resolve_transfer_file(camera, &file, true).await.unwrap();
        assert_eq!(again, Resolution::Existing(orphan));
        assert_eq!(f.store.len().await, 1);
        assert_eq!(f.resolver.pending_count(), 0);
    }

    #[tokio::test]
    async fn unlisted_device_never_yields_orphans() {
        let f = fixture(0);
        let camera = Uuid::new_v4();
        let file = transfer_file("LOOSE-2");

        f.clock.advance(Duration::hours(1));
        let result = f.resolver.resolve_transfer_file(camera, &file, false).await.unwrap();
        assert_eq!(result, Resolution::Pending);
        assert_eq!(f.store.len().await, 0);
    }

    #[tokio::test]
    async fn device_record_adopts_orphan() {
        let f = fixture(0);
        let camera = Uuid::new_v4();
        let orphan = f
            .resolver
            .resolve_transfer_file(camera, &transfer_file("EVT-9"), true)
            .await
            .unwrap()
            .into_event()
            .unwrap();
        assert!(orphan.orphaned);

        let device = record("EVT-9");
        let adopted = f.resolver.resolve_device_record(camera, &device).await.unwrap();
        let adopted = match adopted {
            Resolution::Adopted(e) => e,
            other => panic!("expected adoption, got {:?}", other),
        };
        assert_eq!(adopted.id, orphan.id);
        assert!(!adopted.orphaned);
        assert_eq!(adopted.triggered_at, device.triggered_at);
        assert_eq!(adopted.display_name.as_deref(), Some("motion"));
    }

    #[tokio::test]
    async fn vanished_files_restart_their_grace() {
        let f = fixture(120);
        let camera = Uuid::new_v4();
        f.resolver
            .resolve_transfer_file(camera, &transfer_file("GONE"), true)
            .await
            .unwrap();
        assert_eq!(f.resolver.pending_count(), 1);

        f.resolver.retain_observed(camera, &HashSet::new());
        assert_eq!(f.resolver.pending_count(), 0);
    }
}
