use crate::config::{CameraConfig, TransferConfig};
use crate::db::models::NativeKey;
use crate::error::{Error, Result};
use crate::stores::{ByteStream, TransferFile, TransferStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::Pattern;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

/// `<native key>.<extension>`; the key keeps any inner dots
static FILE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<key>[^.].*)\.(?P<ext>[A-Za-z0-9]+)$").unwrap());

/// Suffixes of files still being written by the uploader
const IN_FLIGHT_SUFFIXES: &[&str] = &[".part", ".tmp"];

/// Transfer store laid out as `<root>/<camera transfer dir>/<key>.<ext>`
#[derive(Debug, Clone)]
pub struct FsTransferStore {
    root: PathBuf,
    /// Lowercase, in priority order
    extensions: Vec<String>,
}

impl FsTransferStore {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            root: config.root.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn camera_dir(&self, camera: &CameraConfig) -> PathBuf {
        self.root.join(camera.transfer_dir())
    }

    fn priority(&self, extension: &str) -> Option<usize> {
        self.extensions.iter().position(|e| e == extension)
    }

    /// Split a file name into native key and accepted extension
    fn parse_name(&self, name: &str) -> Option<(NativeKey, String)> {
        if IN_FLIGHT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return None;
        }
        let caps = FILE_NAME.captures(name)?;
        let ext = caps["ext"].to_ascii_lowercase();
        self.priority(&ext)?;
        Some((NativeKey::parse(&caps["key"])?, ext))
    }

    fn to_transfer_file(
        key: NativeKey,
        extension: String,
        path: PathBuf,
        meta: &Metadata,
    ) -> TransferFile {
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        TransferFile {
            native_key: key,
            path,
            extension,
            size: meta.len(),
            modified,
        }
    }

    /// Best file per key in `dir`, optionally restricted to one key. The
    /// extension match is case-insensitive, so `EVT-1.MP4` is found for
    /// `EVT-1` the same way `list` reports it.
    fn scan_dir(&self, dir: &Path, only: Option<&NativeKey>) -> Result<Vec<TransferFile>> {
        let file_pattern = match only {
            Some(key) => format!("{}.*", Pattern::escape(key.as_str())),
            None => "*".to_string(),
        };
        let pattern = format!(
            "{}/{}",
            Pattern::escape(&dir.to_string_lossy()),
            file_pattern
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("Invalid transfer path {}: {}", dir.display(), e)))?;

        let mut best: HashMap<NativeKey, (usize, TransferFile)> = HashMap::new();
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unreadable transfer entry: {}", e);
                    continue;
                }
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((key, ext)) = self.parse_name(name) else {
                debug!("Ignoring transfer file {}", path.display());
                continue;
            };
            if only.map_or(false, |wanted| *wanted != key) {
                continue;
            }
            let meta = match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    // Removed between the listing and the stat
                    debug!("Transfer file {} vanished: {}", path.display(), e);
                    continue;
                }
            };

            let rank = self.priority(&ext).unwrap_or(usize::MAX);
            match best.get(&key) {
                Some((existing, _)) if *existing <= rank => {}
                _ => {
                    let file = Self::to_transfer_file(key.clone(), ext, path, &meta);
                    best.insert(key, (rank, file));
                }
            }
        }

        let mut files: Vec<TransferFile> = best.into_values().map(|(_, f)| f).collect();
        files.sort_by(|a, b| a.native_key.cmp(&b.native_key));
        Ok(files)
    }
}

impl FsTransferStore {
    async fn scan(&self, dir: PathBuf, only: Option<NativeKey>) -> Result<Vec<TransferFile>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.scan_dir(&dir, only.as_ref()))
            .await
            .map_err(|e| Error::Internal(format!("Transfer scan task failed: {}", e)))?
    }
}

#[async_trait]
impl TransferStore for FsTransferStore {
    async fn list(&self, camera: &CameraConfig) -> Result<Vec<TransferFile>> {
        let dir = self.camera_dir(camera);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::Config(format!(
                    "Transfer path {} is not a directory",
                    dir.display()
                )))
            }
            // Nothing has been pushed for this camera yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::from_io(&format!("stat {}", dir.display()), e)),
        }

        self.scan(dir, None).await
    }

    async fn locate(
        &self,
        camera: &CameraConfig,
        native_key: &NativeKey,
    ) -> Result<Option<TransferFile>> {
        let dir = self.camera_dir(camera);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::from_io(&format!("stat {}", dir.display()), e)),
        }

        let files = self.scan(dir, Some(native_key.clone())).await?;
        Ok(files.into_iter().next())
    }

    async fn open(&self, file: &TransferFile) -> Result<ByteStream> {
        match tokio::fs::File::open(&file.path).await {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "Transfer file {} no longer exists",
                file.path.display()
            ))),
            Err(e) => Err(Error::TransferRead(format!(
                "Failed to open {}: {}",
                file.path.display(),
                e
            ))),
        }
    }
}
