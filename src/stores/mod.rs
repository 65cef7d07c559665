//! Adapters for the three places an event's bytes can live.
//!
//! Each trait is deliberately narrow: existence, listing, read and delete
//! primitives for one store. Nothing here knows about event rows; the sync
//! core correlates stores through [`NativeKey`].

use crate::config::CameraConfig;
use crate::db::models::NativeKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use uuid::Uuid;

pub mod archive;
pub mod device;
pub mod transfer;

pub use archive::FsArchiveStore;
pub use device::HttpDeviceClient;
pub use transfer::FsTransferStore;

/// Canonical shape of one entry in a device's event listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub native_key: NativeKey,
    pub triggered_at: DateTime<Utc>,
    /// Size in bytes, when the firmware reports it
    pub size: Option<u64>,
    pub display_name: Option<String>,
    /// Extension of the media file, lowercase without the dot
    pub extension: Option<String>,
}

/// Device listing and delete API
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list_events(&self, camera: &CameraConfig) -> Result<Vec<DeviceRecord>>;

    async fn delete_event(&self, camera: &CameraConfig, native_key: &NativeKey) -> Result<()>;
}

/// A file found in the transfer store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    pub native_key: NativeKey,
    pub path: PathBuf,
    pub extension: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Read-only view of the drop location devices push files into
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// All complete files for a camera, one per native key
    async fn list(&self, camera: &CameraConfig) -> Result<Vec<TransferFile>>;

    /// Existence check by expected name
    async fn locate(
        &self,
        camera: &CameraConfig,
        native_key: &NativeKey,
    ) -> Result<Option<TransferFile>>;

    async fn open(&self, file: &TransferFile) -> Result<ByteStream>;
}

/// A fully written staging file that has not been moved into place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub bytes_written: u64,
}

/// The application's own archive
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    fn path_for(&self, camera_id: &Uuid, native_key: &NativeKey, extension: &str) -> PathBuf;

    fn thumbnail_path_for(&self, camera_id: &Uuid, native_key: &NativeKey) -> PathBuf;

    /// Where `stage` writes before the file is committed to `target`
    fn staging_path(&self, target: &Path) -> PathBuf;

    /// Size of the file at `path`, `None` when it does not exist
    async fn size_of(&self, path: &Path) -> Result<Option<u64>>;

    /// Copy `reader` into the staging path for `target`. Read failures are
    /// reported as `Error::TransferRead`, write failures as archive errors.
    async fn stage(&self, target: &Path, reader: &mut ByteStream) -> Result<StagedFile>;

    /// Atomically move a staged file into place
    async fn commit(&self, staged: &StagedFile, target: &Path) -> Result<()>;

    /// Remove a staging file; a missing file is not an error
    async fn discard(&self, path: &Path) -> Result<()>;

    /// Move a staged file aside for operator inspection
    async fn quarantine(&self, staged: &StagedFile, event_id: &Uuid) -> Result<PathBuf>;

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    /// Delete a file. Returns whether something was removed; an already
    /// missing file is a success.
    async fn delete(&self, path: &Path) -> Result<bool>;
}

/// MIME type for an archived file extension
pub fn content_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// Read-only registry of configured cameras
#[derive(Debug, Clone, Default)]
pub struct CameraRegistry {
    cameras: HashMap<Uuid, CameraConfig>,
}

impl CameraRegistry {
    pub fn new(cameras: Vec<CameraConfig>) -> Self {
        Self {
            cameras: cameras.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Result<&CameraConfig> {
        self.cameras
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Camera {} is not configured", id)))
    }

    pub fn all(&self) -> Vec<&CameraConfig> {
        let mut cameras: Vec<_> = self.cameras.values().collect();
        cameras.sort_by(|a, b| a.name.cmp(&b.name));
        cameras
    }
}
