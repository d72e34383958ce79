use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of background work, tagged by `kind` on the wire.
///
/// Kinds this build does not know deserialize to [`IngestionJob::Unknown`]
/// so a newer producer cannot wedge an older worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IngestionJob {
    Upload(UploadJob),
    Patch(PatchJob),
    Delete(DeleteJob),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    pub video_id: Uuid,
    pub video_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub title: String,
    pub is_published: bool,
    pub owner_email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchJob {
    pub video_id: Uuid,
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_published: Option<bool>,
    pub video_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
    pub owner_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteJob {
    pub video_id: Uuid,
}

impl IngestionJob {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionJob::Upload(_) => "upload",
            IngestionJob::Patch(_) => "patch",
            IngestionJob::Delete(_) => "delete",
            IngestionJob::Unknown => "unknown",
        }
    }

    pub fn video_id(&self) -> Option<Uuid> {
        match self {
            IngestionJob::Upload(job) => Some(job.video_id),
            IngestionJob::Patch(job) => Some(job.video_id),
            IngestionJob::Delete(job) => Some(job.video_id),
            IngestionJob::Unknown => None,
        }
    }

    /// Local files this job owns until it succeeds or fails for good.
    pub fn temp_files(&self) -> Vec<&Path> {
        match self {
            IngestionJob::Upload(job) => vec![job.video_path.as_path(), job.thumbnail_path.as_path()],
            IngestionJob::Patch(job) => job
                .video_path
                .iter()
                .chain(job.thumbnail_path.iter())
                .map(PathBuf::as_path)
                .collect(),
            IngestionJob::Delete(_) | IngestionJob::Unknown => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts have failed so far.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exp))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_success: bool,
    pub remove_on_failure: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay_ms: 5000 },
            remove_on_success: true,
            remove_on_failure: false,
        }
    }
}

/// What the queue should do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    RetryAfter(Duration),
    Exhausted,
}

/// A job plus its delivery bookkeeping, as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub id: Uuid,
    pub job: IngestionJob,
    pub attempts_made: u32,
    pub options: JobOptions,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    pub fn new(job: IngestionJob, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            attempts_made: 0,
            options,
            enqueued_at: Utc::now(),
            trace_context: HashMap::new(),
            last_error: None,
            failed_at: None,
        }
    }

    /// Number of the attempt currently being executed (1-based).
    pub fn current_attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Counts a failed attempt and decides between another try and giving up.
    pub fn record_failure(&mut self, error: &str) -> FailureDisposition {
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());

        if self.attempts_made < self.options.attempts {
            FailureDisposition::RetryAfter(self.options.backoff.delay_after(self.attempts_made))
        } else {
            self.failed_at = Some(Utc::now());
            FailureDisposition::Exhausted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let backoff = Backoff::Exponential { delay_ms: 5000 };
        assert_eq!(backoff.delay_after(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_after(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_after(3), Duration::from_secs(20));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed { delay_ms: 250 };
        assert_eq!(backoff.delay_after(1), backoff.delay_after(4));
    }

    #[test]
    fn three_attempts_retry_twice_then_exhaust() {
        let mut envelope = JobEnvelope::new(
            IngestionJob::Delete(DeleteJob { video_id: Uuid::new_v4() }),
            JobOptions::default(),
        );

        assert_eq!(
            envelope.record_failure("boom"),
            FailureDisposition::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(
            envelope.record_failure("boom"),
            FailureDisposition::RetryAfter(Duration::from_secs(10))
        );
        assert_eq!(envelope.record_failure("boom"), FailureDisposition::Exhausted);
        assert_eq!(envelope.attempts_made, 3);
        assert!(envelope.failed_at.is_some());
        assert_eq!(envelope.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn job_kind_is_the_wire_tag() {
        let job = IngestionJob::Delete(DeleteJob { video_id: Uuid::nil() });
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "delete");
        assert_eq!(json["videoId"], "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn unrecognised_kind_decodes_as_unknown() {
        let job: IngestionJob =
            serde_json::from_str(r#"{"kind":"transcode","videoId":"abc"}"#).unwrap();
        assert_eq!(job, IngestionJob::Unknown);
        assert_eq!(job.video_id(), None);
    }

    #[test]
    fn patch_owns_only_the_files_it_carries() {
        let job = IngestionJob::Patch(PatchJob {
            video_id: Uuid::new_v4(),
            thumbnail_path: Some(PathBuf::from("/tmp/thumb.png")),
            ..Default::default()
        });
        assert_eq!(job.temp_files(), vec![Path::new("/tmp/thumb.png")]);
    }
}
