use crate::config::CameraConfig;
use crate::db::models::NativeKey;
use crate::error::{Error, Result};
use crate::stores::{DeviceRecord, DeviceStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Event listing as returned by the known firmware generations.
///
/// Older firmware answers with a bare array of camelCase records; newer
/// firmware wraps snake_case records in a versioned envelope that also
/// reports file sizes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeviceListing {
    Envelope(EnvelopeListing),
    Legacy(Vec<LegacyEvent>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEvent {
    file_name: String,
    triggered_at: String,
    event_name: Option<String>,
    vid_ext: Option<String>,
    thmb_ext: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeListing {
    schema_version: u32,
    events: Vec<EnvelopeEvent>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeEvent {
    file_name: String,
    triggered_at: String,
    size_bytes: Option<u64>,
    name: Option<String>,
    extension: Option<String>,
}

/// Parse a device timestamp. RFC 3339 is preferred; naive ISO timestamps
/// are taken as UTC.
pub fn parse_device_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn normalize_extension(ext: Option<&str>) -> Option<String> {
    ext.map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
}

fn checked_key(file_name: &str) -> Option<NativeKey> {
    let key = NativeKey::parse(file_name);
    if key.is_none() {
        warn!("Skipping device event with unusable file name '{}'", file_name);
    }
    key
}

/// Decode a listing body into canonical records. Entries with an
/// unreadable timestamp are skipped.
pub fn decode_listing(body: &[u8]) -> Result<Vec<DeviceRecord>> {
    let listing: DeviceListing = serde_json::from_slice(body)
        .map_err(|e| Error::Serialization(format!("Unrecognised device listing: {}", e)))?;

    let records = match listing {
        DeviceListing::Legacy(events) => events
            .into_iter()
            .filter_map(|e| {
                let triggered_at = match parse_device_timestamp(&e.triggered_at) {
                    Some(ts) => ts,
                    None => {
                        warn!(
                            "Skipping device event {} with invalid timestamp '{}'",
                            e.file_name, e.triggered_at
                        );
                        return None;
                    }
                };
                let native_key = checked_key(&e.file_name)?;
                let extension = normalize_extension(e.vid_ext.as_deref())
                    .or_else(|| normalize_extension(e.thmb_ext.as_deref()));
                Some(DeviceRecord {
                    native_key,
                    triggered_at,
                    size: None,
                    display_name: e.event_name,
                    extension,
                })
            })
            .collect(),
        DeviceListing::Envelope(envelope) => {
            debug!(
                "Decoding device listing schema v{} ({} events)",
                envelope.schema_version,
                envelope.events.len()
            );
            envelope
                .events
                .into_iter()
                .filter_map(|e| {
                    let triggered_at = match parse_device_timestamp(&e.triggered_at) {
                        Some(ts) => ts,
                        None => {
                            warn!(
                                "Skipping device event {} with invalid timestamp '{}'",
                                e.file_name, e.triggered_at
                            );
                            return None;
                        }
                    };
                    Some(DeviceRecord {
                        native_key: checked_key(&e.file_name)?,
                        triggered_at,
                        size: e.size_bytes,
                        display_name: e.name,
                        extension: normalize_extension(e.extension.as_deref()),
                    })
                })
                .collect()
        }
    };

    Ok(records)
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn status_error(status: StatusCode, context: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(format!("{}: device returned 404", context)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::PermissionDenied(format!("{}: device returned {}", context, status))
        }
        s if s.is_server_error() => {
            Error::DeviceUnreachable(format!("{}: device returned {}", context, s))
        }
        s => Error::Service(format!("{}: device returned {}", context, s)),
    }
}

fn transport_error(err: reqwest::Error, context: &str) -> Error {
    // Connect failures, timeouts and broken bodies all mean the device
    // could not be asked
    Error::DeviceUnreachable(format!("{}: {}", context, err))
}

/// Client for the camera's HTTP event API
#[derive(Clone)]
pub struct HttpDeviceClient {
    client: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// `<base>/api/events`, tolerating a base URL that already ends in `/api`
    pub fn events_url(base: &Url) -> Result<Url> {
        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Config(format!("Camera URL {} cannot be a base", base)))?;
            segments.pop_if_empty();
        }
        let ends_with_api = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .map_or(false, |last| last == "api");
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Config(format!("Camera URL {} cannot be a base", base)))?;
            if !ends_with_api {
                segments.push("api");
            }
            segments.push("events");
        }
        Ok(url)
    }
}

#[async_trait]
impl DeviceStore for HttpDeviceClient {
    async fn list_events(&self, camera: &CameraConfig) -> Result<Vec<DeviceRecord>> {
        let url = Self::events_url(&camera.base_url)?;
        let context = format!("list events on {}", camera.name);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, &context))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), &context));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, &context))?;

        decode_listing(&body)
    }

    async fn delete_event(&self, camera: &CameraConfig, native_key: &NativeKey) -> Result<()> {
        let mut url = Self::events_url(&camera.base_url)?;
        let not_a_base = format!("Camera URL {} cannot be a base", url);
        url.path_segments_mut()
            .map_err(|_| Error::Config(not_a_base))?
            .push(native_key.as_str());
        let context = format!("delete {} on {}", native_key, camera.name);

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| transport_error(e, &context))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), &context));
        }

        Ok(())
    }
}
