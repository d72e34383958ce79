//! Multipart intake for the video endpoints.
//!
//! Files are streamed chunk by chunk into the upload directory and rejected as
//! soon as they cross their size limit. Whatever was written is removed again
//! when the form is rejected.

use std::path::{Path, PathBuf};

use axum::extract::multipart::{Field, Multipart};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::UploadLimits;
use crate::entities::video;
use crate::error::{AppError, AppResult};
use crate::worker::remove_temp_files;

#[derive(Debug, Clone)]
pub struct SavedFile {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct VideoForm {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_published: Option<bool>,
    pub video: Option<SavedFile>,
    pub thumbnail: Option<SavedFile>,
}

/// A complete submission for a new video.
#[derive(Debug)]
pub struct NewUpload {
    pub title: String,
    pub description: String,
    pub is_published: bool,
    pub video: SavedFile,
    pub thumbnail: SavedFile,
}

/// A partial edit; blank text fields were rejected, absent ones stay `None`.
#[derive(Debug, Default)]
pub struct VideoEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_published: Option<bool>,
    pub video: Option<SavedFile>,
    pub thumbnail: Option<SavedFile>,
}

impl VideoEdit {
    pub fn has_files(&self) -> bool {
        self.video.is_some() || self.thumbnail.is_some()
    }

    pub fn temp_files(&self) -> Vec<&Path> {
        self.video
            .iter()
            .chain(self.thumbnail.iter())
            .map(|f| f.path.as_path())
            .collect()
    }

    /// The file field this edit must carry because `existing` still holds a
    /// placeholder for it. A media edit can only complete a fully resolved record.
    pub fn unresolved_media(&self, existing: &video::Model) -> Option<&'static str> {
        if self.video.is_none() && existing.video_file == video::PLACEHOLDER_URL {
            return Some(FileKind::Video.field());
        }
        if self.thumbnail.is_none() && existing.thumbnail == video::PLACEHOLDER_URL {
            return Some(FileKind::Thumbnail.field());
        }
        None
    }
}

/// A rejected form still holding the files it wrote.
#[derive(Debug)]
pub struct Rejected {
    error: AppError,
    leftovers: Vec<PathBuf>,
}

impl Rejected {
    /// Removes the leftover files and hands back the error for the response.
    pub async fn discard(self) -> AppError {
        let paths: Vec<&Path> = self.leftovers.iter().map(|p| p.as_path()).collect();
        remove_temp_files(&paths).await;
        self.error
    }
}

impl VideoForm {
    /// Reads every field of the request. On failure nothing stays on disk.
    pub async fn read(mut multipart: Multipart, limits: &UploadLimits) -> AppResult<Self> {
        let mut form = VideoForm::default();
        match form.read_fields(&mut multipart, limits).await {
            Ok(()) => Ok(form),
            Err(e) => {
                form.discard().await;
                Err(e)
            }
        }
    }

    async fn read_fields(&mut self, multipart: &mut Multipart, limits: &UploadLimits) -> AppResult<()> {
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "title" => self.title = Some(field.text().await?),
                "description" => self.description = Some(field.text().await?),
                "isPublished" => self.is_published = Some(parse_flag(&field.text().await?)?),
                "videoFile" => {
                    let saved = save_field(field, limits, FileKind::Video).await?;
                    replace_file(&mut self.video, saved).await;
                }
                "thumbnail" => {
                    let saved = save_field(field, limits, FileKind::Thumbnail).await?;
                    replace_file(&mut self.thumbnail, saved).await;
                }
                other => tracing::debug!(field = other, "ignoring unknown form field"),
            }
        }
        Ok(())
    }

    fn file_paths(&self) -> Vec<PathBuf> {
        self.video
            .iter()
            .chain(self.thumbnail.iter())
            .map(|f| f.path.clone())
            .collect()
    }

    pub async fn discard(self) {
        let paths = self.file_paths();
        let paths: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
        remove_temp_files(&paths).await;
    }

    pub fn into_new_upload(self) -> Result<NewUpload, Rejected> {
        let leftovers = self.file_paths();
        let title = non_blank(self.title);
        let description = non_blank(self.description);

        match (title, description, self.video, self.thumbnail) {
            (Some(title), Some(description), Some(video), Some(thumbnail)) => Ok(NewUpload {
                title,
                description,
                is_published: self.is_published.unwrap_or(true),
                video,
                thumbnail,
            }),
            (None, _, _, _) | (_, None, _, _) => Err(Rejected {
                error: AppError::validation("title and description are required"),
                leftovers,
            }),
            _ => Err(Rejected {
                error: AppError::validation("video file and thumbnail are required"),
                leftovers,
            }),
        }
    }

    pub fn into_edit(self) -> Result<VideoEdit, Rejected> {
        let leftovers = self.file_paths();
        let blank = |v: &Option<String>| v.as_deref().is_some_and(|s| s.trim().is_empty());

        if blank(&self.title) || blank(&self.description) {
            return Err(Rejected {
                error: AppError::validation("title and description cannot be empty"),
                leftovers,
            });
        }

        Ok(VideoEdit {
            title: self.title.map(|s| s.trim().to_string()),
            description: self.description.map(|s| s.trim().to_string()),
            is_published: self.is_published,
            video: self.video,
            thumbnail: self.thumbnail,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_flag(raw: &str) -> AppResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        other => Err(AppError::validation(format!(
            "isPublished must be a boolean, got '{}'",
            other
        ))),
    }
}

async fn replace_file(slot: &mut Option<SavedFile>, saved: SavedFile) {
    if let Some(previous) = slot.replace(saved) {
        remove_temp_files(&[previous.path.as_path()]).await;
    }
}

#[derive(Debug, Clone, Copy)]
enum FileKind {
    Video,
    Thumbnail,
}

impl FileKind {
    fn field(self) -> &'static str {
        match self {
            FileKind::Video => "videoFile",
            FileKind::Thumbnail => "thumbnail",
        }
    }

    fn max_bytes(self, limits: &UploadLimits) -> u64 {
        match self {
            FileKind::Video => limits.max_video_bytes,
            FileKind::Thumbnail => limits.max_thumbnail_bytes,
        }
    }

    fn accepts(self, mime: &mime::Mime) -> bool {
        match self {
            FileKind::Video => mime.type_() == mime::VIDEO,
            FileKind::Thumbnail => mime.type_() == mime::IMAGE,
        }
    }
}

/// Declared content type, falling back to a guess from the file name.
fn field_mime(content_type: Option<&str>, file_name: Option<&str>) -> Option<mime::Mime> {
    content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .filter(|m| *m != mime::APPLICATION_OCTET_STREAM)
        .or_else(|| file_name.and_then(|n| mime_guess::from_path(n).first()))
}

fn temp_name(file_name: Option<&str>) -> String {
    let ext = file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()));
    match ext {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    }
}

fn human_size(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    if bytes >= MB && bytes % MB == 0 {
        format!("{}MB", bytes / MB)
    } else {
        format!("{} bytes", bytes)
    }
}

async fn save_field(mut field: Field<'_>, limits: &UploadLimits, kind: FileKind) -> AppResult<SavedFile> {
    let file_name = field.file_name().map(str::to_string);
    let content_type = field_mime(field.content_type(), file_name.as_deref());

    if !content_type.as_ref().is_some_and(|m| kind.accepts(m)) {
        return Err(AppError::validation(format!(
            "{} has an unsupported content type",
            kind.field()
        )));
    }

    tokio::fs::create_dir_all(&limits.tmp_dir).await?;
    let path = limits.tmp_dir.join(temp_name(file_name.as_deref()));
    let max = kind.max_bytes(limits);

    let written = async {
        let mut file = tokio::fs::File::create(&path).await?;
        let mut size: u64 = 0;
        while let Some(chunk) = field.chunk().await? {
            size += chunk.len() as u64;
            if size > max {
                return Err(AppError::validation(format!(
                    "{} exceeds the {} limit",
                    kind.field(),
                    human_size(max)
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok::<u64, AppError>(size)
    }
    .await;

    match written {
        Ok(size) => {
            tracing::debug!(field = kind.field(), path = %path.display(), size, "upload stored");
            Ok(SavedFile { path, size })
        }
        Err(e) => {
            remove_temp_files(&[path.as_path()]).await;
            Err(e)
        }
    }
}
