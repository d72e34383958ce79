//! Media store adapter: pushes local uploads to object storage.
//!
//! Object names are derived from the video id alone, so re-running an upload
//! for the same record overwrites the object instead of creating a second one.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use google_cloud_storage::client::Client as GcsClient;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::MediaSettings;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of {object} failed: {message}")]
    Upload { object: String, message: String },

    #[error("delete of {object} failed: {message}")]
    Delete { object: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedMedia {
    pub url: String,
    /// Seconds; only known for video.
    pub duration: Option<f64>,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload_video(&self, local_path: &Path, video_id: Uuid) -> Result<UploadedMedia, MediaError>;

    async fn upload_image(&self, local_path: &Path, video_id: Uuid) -> Result<UploadedMedia, MediaError>;

    /// Missing objects are not an error.
    async fn delete_video(&self, video_id: Uuid) -> Result<(), MediaError>;

    async fn delete_image(&self, video_id: Uuid) -> Result<(), MediaError>;
}

pub fn video_object_name(video_id: Uuid) -> String {
    format!("videos/{}", video_id)
}

pub fn thumbnail_object_name(video_id: Uuid) -> String {
    format!("thumbnails/{}", video_id)
}

#[derive(Clone)]
pub struct GcsMediaStore {
    client: GcsClient,
    settings: MediaSettings,
}

impl GcsMediaStore {
    pub fn new(client: GcsClient, settings: MediaSettings) -> Self {
        Self { client, settings }
    }

    fn public_url(&self, object: &str) -> String {
        format!("{}/{}", self.settings.public_base_url, object)
    }

    async fn put_object(&self, local_path: &Path, object: String) -> Result<String, MediaError> {
        let data = tokio::fs::read(local_path).await.map_err(|source| MediaError::Read {
            path: local_path.display().to_string(),
            source,
        })?;
        let mime_type = mime_guess::from_path(local_path)
            .first_or_octet_stream()
            .to_string();

        let upload_type = UploadType::Simple(Media {
            name: object.clone().into(),
            content_type: mime_type.into(),
            content_length: Some(data.len() as u64),
        });

        tracing::info!(bucket = %self.settings.bucket, object = %object, bytes = data.len(), "uploading object");
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.settings.bucket.clone(),
                    ..Default::default()
                },
                data,
                &upload_type,
            )
            .await
            .map_err(|e| MediaError::Upload {
                object: object.clone(),
                message: e.to_string(),
            })?;

        Ok(self.public_url(&object))
    }

    async fn remove_object(&self, object: String) -> Result<(), MediaError> {
        let request = DeleteObjectRequest {
            bucket: self.settings.bucket.clone(),
            object: object.clone(),
            ..Default::default()
        };

        match self.client.delete_object(&request).await {
            Ok(()) => Ok(()),
            Err(google_cloud_storage::http::Error::Response(e)) if e.code == 404 => {
                tracing::debug!(object = %object, "object already gone");
                Ok(())
            }
            Err(e) => Err(MediaError::Delete {
                object,
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl MediaStore for GcsMediaStore {
    async fn upload_video(&self, local_path: &Path, video_id: Uuid) -> Result<UploadedMedia, MediaError> {
        let duration = probe_duration(&self.settings.ffprobe_path, local_path).await;
        let url = self.put_object(local_path, video_object_name(video_id)).await?;
        Ok(UploadedMedia { url, duration })
    }

    async fn upload_image(&self, local_path: &Path, video_id: Uuid) -> Result<UploadedMedia, MediaError> {
        let url = self.put_object(local_path, thumbnail_object_name(video_id)).await?;
        Ok(UploadedMedia { url, duration: None })
    }

    async fn delete_video(&self, video_id: Uuid) -> Result<(), MediaError> {
        self.remove_object(video_object_name(video_id)).await
    }

    async fn delete_image(&self, video_id: Uuid) -> Result<(), MediaError> {
        self.remove_object(thumbnail_object_name(video_id)).await
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Reads the container duration with ffprobe. A missing binary or an
/// unreadable file yields `None`; the record then keeps duration 0.
pub async fn probe_duration(ffprobe: &str, path: &Path) -> Option<f64> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match output {
        Ok(o) if o.status.success() => o,
        Ok(o) => {
            tracing::warn!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&o.stderr),
                "ffprobe failed"
            );
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "ffprobe unavailable");
            return None;
        }
    };

    parse_ffprobe_duration(&output.stdout)
}

fn parse_ffprobe_duration(stdout: &[u8]) -> Option<f64> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout).ok()?;
    probe
        .format
        .duration
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}
