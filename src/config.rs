use std::path::PathBuf;
use std::time::Duration;

use crate::queue::{Backoff, JobOptions};

/// Process-wide settings, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub cors_origin: String,
    pub upload: UploadLimits,
    pub media: MediaSettings,
    pub cache_ttl: Duration,
    pub queue_name: String,
    pub job_options: JobOptions,
    pub worker_concurrency: usize,
    pub record_expiry: Duration,
    pub sendgrid_api_key: Option<String>,
    pub email_from: String,
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub tmp_dir: PathBuf,
    pub max_video_bytes: u64,
    pub max_thumbnail_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("./public/temp"),
            max_video_bytes: 100 * 1024 * 1024,
            max_thumbnail_bytes: 10 * 1024 * 1024,
        }
    }
}

impl UploadLimits {
    /// Largest request body the server must accept for a full upload.
    pub fn body_limit(&self) -> usize {
        (self.max_video_bytes + self.max_thumbnail_bytes + 1024 * 1024) as usize
    }
}

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub bucket: String,
    pub public_base_url: String,
    pub ffprobe_path: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let upload_defaults = UploadLimits::default();
        let bucket = env_or("GCS_BUCKET_NAME", "streamify-media");
        let public_base_url = env_or(
            "MEDIA_PUBLIC_BASE_URL",
            &format!("https://storage.googleapis.com/{}", bucket),
        );

        Self {
            port: env_parse("PORT", 8000),
            database_url: env_or("DATABASE_URL", "postgres://localhost/streamify"),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            cors_origin: env_or("CORS_ORIGIN", "http://localhost:5173"),
            upload: UploadLimits {
                tmp_dir: std::env::var("UPLOAD_TMP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(upload_defaults.tmp_dir),
                max_video_bytes: env_parse("MAX_VIDEO_BYTES", upload_defaults.max_video_bytes),
                max_thumbnail_bytes: env_parse(
                    "MAX_THUMBNAIL_BYTES",
                    upload_defaults.max_thumbnail_bytes,
                ),
            },
            media: MediaSettings {
                bucket,
                public_base_url: public_base_url.trim_end_matches('/').to_string(),
                ffprobe_path: env_or("FFPROBE_PATH", "ffprobe"),
            },
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 300)),
            queue_name: env_or("QUEUE_NAME", "video-processing"),
            job_options: JobOptions {
                attempts: env_parse("QUEUE_ATTEMPTS", 3u32).max(1),
                backoff: Backoff::Exponential {
                    delay_ms: env_parse("QUEUE_BACKOFF_BASE_MS", 5000),
                },
                ..JobOptions::default()
            },
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 3usize).max(1),
            record_expiry: Duration::from_secs(env_parse("RECORD_EXPIRY_SECONDS", 420)),
            sendgrid_api_key: std::env::var("SENDGRID_API_KEY").ok(),
            email_from: env_or("NOTIFICATION_EMAIL_FROM", "no-reply@streamify.app"),
        }
    }
}
