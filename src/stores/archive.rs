use crate::config::ArchiveConfig;
use crate::db::models::NativeKey;
use crate::error::{Error, Result};
use crate::stores::{ArchiveStore, ByteStream, StagedFile};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Local archive on the filesystem.
///
/// Layout is `<root>/<camera id>/<key>.<ext>` with thumbnails under
/// `<root>/<camera id>/thumbnails/`. Files are written to a `.part` sibling
/// and renamed into place, so a reader never sees a partial archive file.
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
    quarantine_dir: PathBuf,
}

impl FsArchiveStore {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            root: config.root.clone(),
            quarantine_dir: config.quarantine_dir(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(&format!("create {}", parent.display()), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    fn path_for(&self, camera_id: &Uuid, native_key: &NativeKey, extension: &str) -> PathBuf {
        self.root
            .join(camera_id.to_string())
            .join(format!("{}.{}", native_key, extension))
    }

    fn thumbnail_path_for(&self, camera_id: &Uuid, native_key: &NativeKey) -> PathBuf {
        self.root
            .join(camera_id.to_string())
            .join("thumbnails")
            .join(format!("{}.jpg", native_key))
    }

    fn staging_path(&self, target: &Path) -> PathBuf {
        let mut name = OsString::from(target.as_os_str());
        name.push(".part");
        PathBuf::from(name)
    }

    async fn size_of(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from_io(&format!("stat {}", path.display()), e)),
        }
    }

    async fn stage(&self, target: &Path, reader: &mut ByteStream) -> Result<StagedFile> {
        let staging = self.staging_path(target);
        Self::ensure_parent(&staging).await?;

        let mut file = fs::File::create(&staging)
            .await
            .map_err(|e| Error::from_io(&format!("create {}", staging.display()), e))?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut bytes_written: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| Error::TransferRead(format!("Read failed after {} bytes: {}", bytes_written, e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| Error::from_io(&format!("write {}", staging.display()), e))?;
            bytes_written += n as u64;
        }

        file.flush()
            .await
            .map_err(|e| Error::from_io(&format!("flush {}", staging.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::from_io(&format!("sync {}", staging.display()), e))?;

        debug!("Staged {} bytes at {}", bytes_written, staging.display());

        Ok(StagedFile {
            path: staging,
            bytes_written,
        })
    }

    async fn commit(&self, staged: &StagedFile, target: &Path) -> Result<()> {
        fs::rename(&staged.path, target).await.map_err(|e| {
            Error::from_io(
                &format!("rename {} to {}", staged.path.display(), target.display()),
                e,
            )
        })
    }

    async fn discard(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("Discarded staging file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(&format!("remove {}", path.display()), e)),
        }
    }

    async fn quarantine(&self, staged: &StagedFile, event_id: &Uuid) -> Result<PathBuf> {
        fs::create_dir_all(&self.quarantine_dir).await.map_err(|e| {
            Error::from_io(&format!("create {}", self.quarantine_dir.display()), e)
        })?;

        let file_name = staged
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "staged".to_string());
        let dest = self.quarantine_dir.join(format!("{}-{}", event_id, file_name));

        fs::rename(&staged.path, &dest).await.map_err(|e| {
            Error::from_io(&format!("quarantine {}", staged.path.display()), e)
        })?;

        warn!(
            "Quarantined {} for event {} at {}",
            staged.path.display(),
            event_id,
            dest.display()
        );
        Ok(dest)
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        Self::ensure_parent(path).await?;
        let staging = self.staging_path(path);
        fs::write(&staging, bytes)
            .await
            .map_err(|e| Error::from_io(&format!("write {}", staging.display()), e))?;
        fs::rename(&staging, path)
            .await
            .map_err(|e| Error::from_io(&format!("rename {}", staging.display()), e))
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                info!("Deleted archive file {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::from_io(&format!("delete {}", path.display()), e)),
        }
    }
}
