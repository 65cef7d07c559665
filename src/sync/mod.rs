//! Event lifecycle and multi-store synchronization.

use crate::db::models::Event;
use crate::stores::ArchiveStore;
use std::path::PathBuf;

pub mod cache;
pub mod clock;
pub mod deletion;
pub mod engine;
pub mod health;
pub mod ingest;
pub mod locks;
pub mod presence;
pub mod prober;
pub mod resolver;
pub mod retention;
pub mod retry;
pub mod thumbnail;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use deletion::{DeletionCoordinator, LocalDeletion};
pub use engine::{ArchivedFile, SyncEngine, SyncSummary};
pub use health::{CameraHealthMonitor, CameraStatus};
pub use ingest::IngestPipeline;
pub use presence::{LifecycleState, Presence, PresenceVector};
pub use prober::SyncProber;
pub use resolver::{EventResolver, Resolution};
pub use retention::{RetentionPreview, RetentionSweeper, SweepReport, SweepState};

/// Archive location of an event's file: the recorded path, or the path the
/// archive layout gives it when nothing was recorded
pub fn archive_path(archive: &dyn ArchiveStore, event: &Event) -> Option<PathBuf> {
    event.local_path.clone().or_else(|| {
        event
            .extension
            .as_deref()
            .map(|ext| archive.path_for(&event.camera_id, &event.native_key, ext))
    })
}
