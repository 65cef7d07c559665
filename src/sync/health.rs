//! Camera reachability tracking.

use crate::messaging::EventNotifier;
use crate::stores::CameraRegistry;
use crate::sync::clock::Clock;
use crate::sync::prober::SyncProber;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Last known reachability of one camera
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CameraStatus {
    pub camera_id: Uuid,
    pub name: String,
    pub online: bool,
    pub checked_at: DateTime<Utc>,
    /// Last time the camera answered
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct CameraHealthMonitor {
    registry: Arc<CameraRegistry>,
    prober: Arc<SyncProber>,
    clock: Arc<dyn Clock>,
    notifier: EventNotifier,
    statuses: Mutex<HashMap<Uuid, CameraStatus>>,
}

impl CameraHealthMonitor {
    pub fn new(
        registry: Arc<CameraRegistry>,
        prober: Arc<SyncProber>,
        clock: Arc<dyn Clock>,
        notifier: EventNotifier,
    ) -> Self {
        Self {
            registry,
            prober,
            clock,
            notifier,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Ask every camera for its listing and publish the cameras whose
    /// reachability changed. A camera first seen offline is published too.
    pub async fn check_all(&self) -> Vec<CameraStatus> {
        let mut checked = Vec::new();
        for camera in self.registry.all() {
            let online = match self.prober.fetch_listing(camera).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Camera {} failed its health check: {}", camera.name, e);
                    false
                }
            };
            let now = self.clock.now();

            let (status, changed) = {
                let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
                let previous = statuses.get(&camera.id);
                let changed = match previous {
                    Some(prev) => prev.online != online,
                    None => !online,
                };
                let status = CameraStatus {
                    camera_id: camera.id,
                    name: camera.name.clone(),
                    online,
                    checked_at: now,
                    last_seen: if online {
                        Some(now)
                    } else {
                        previous.and_then(|p| p.last_seen)
                    },
                };
                statuses.insert(camera.id, status.clone());
                (status, changed)
            };

            if changed {
                info!(
                    "Camera {} is now {}",
                    camera.name,
                    if online { "online" } else { "offline" }
                );
                self.notifier
                    .camera_status(camera.id, &camera.name, online)
                    .await;
            }
            checked.push(status);
        }
        checked
    }

    /// Results of the last check, by camera name
    pub fn statuses(&self) -> Vec<CameraStatus> {
        let mut statuses: Vec<_> = self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use crate::messaging::EventType;
    use crate::sync::testing::Harness;

    #[tokio::test]
    async fn reachability_changes_are_published_once() {
        let h = Harness::new().await;
        let health = h.engine.health().clone();
        let mut rx = h.broker.subscribe();

        let first = health.check_all().await;
        assert_eq!(first.len(), 1);
        assert!(first[0].online);
        assert!(first[0].last_seen.is_some());
        // Online on first sight is the expected state
        assert!(rx.try_recv().is_err());

        h.device.set_reachable(false);
        let down = health.check_all().await;
        assert!(!down[0].online);
        assert_eq!(down[0].last_seen, first[0].last_seen);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.event_type, EventType::CameraOffline);
        assert_eq!(message.source_id, Some(h.camera.id));

        health.check_all().await;
        assert!(rx.try_recv().is_err());

        h.device.set_reachable(true);
        health.check_all().await;
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::CameraOnline);
        assert!(health.statuses()[0].online);
    }
}
