#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tokio::time::Instant;
use uuid::Uuid;

use streamify_server::api::{self, AppContext};
use streamify_server::cache::{Cache, CacheBackend, CacheError};
use streamify_server::config::UploadLimits;
use streamify_server::entities::{user, video, VideoStatus};
use streamify_server::media::{MediaError, MediaStore, UploadedMedia};
use streamify_server::notifications::{EmailMessage, Notifier, NotifyError};
use streamify_server::redis;
use streamify_server::queue::{
    JobEnvelope, JobHandle, JobOptions, JobQueue, QueueClient, QueueDepth, QueueError,
    QueueResult, ReservedJob,
};
use streamify_server::store::{
    self, EngagementPurge, FeedPage, FeedQuery, SortField, SortOrder, StoreError, StoreResult,
    UserDirectory, VideoChanges, VideoStore,
};
use streamify_server::worker::IngestionWorker;

fn connection_refused() -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"))
}

// ============================================================================
// Record store
// ============================================================================

#[derive(Default)]
pub struct InMemoryVideoStore {
    videos: Mutex<HashMap<Uuid, video::Model>>,
    comments: Mutex<Vec<Uuid>>,
    likes: Mutex<Vec<Uuid>>,
}

impl InMemoryVideoStore {
    pub fn seed(&self, video: video::Model) {
        self.videos.lock().unwrap().insert(video.id, video);
    }

    pub fn get(&self, id: Uuid) -> Option<video::Model> {
        self.videos.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.videos.lock().unwrap().len()
    }

    pub fn add_comment(&self, video_id: Uuid) {
        self.comments.lock().unwrap().push(video_id);
    }

    pub fn add_like(&self, video_id: Uuid) {
        self.likes.lock().unwrap().push(video_id);
    }

    pub fn engagement(&self, video_id: Uuid) -> usize {
        let comments = self.comments.lock().unwrap().iter().filter(|v| **v == video_id).count();
        let likes = self.likes.lock().unwrap().iter().filter(|v| **v == video_id).count();
        comments + likes
    }
}

#[async_trait]
impl VideoStore for InMemoryVideoStore {
    async fn insert(&self, video: video::Model) -> StoreResult<video::Model> {
        self.videos.lock().unwrap().insert(video.id, video.clone());
        Ok(video)
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<video::Model>> {
        Ok(self.get(id))
    }

    async fn update(&self, id: Uuid, changes: VideoChanges) -> StoreResult<video::Model> {
        let mut videos = self.videos.lock().unwrap();
        let video = videos.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        changes.apply(video);
        Ok(video.clone())
    }

    async fn mark_failed(&self, id: Uuid) -> StoreResult<bool> {
        let mut videos = self.videos.lock().unwrap();
        match videos.get_mut(&id) {
            Some(video) if video.status == VideoStatus::Processing => {
                video.status = VideoStatus::Failed;
                video.updated_at = store::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> StoreResult<Option<video::Model>> {
        Ok(self.videos.lock().unwrap().remove(&id))
    }

    async fn delete_engagement(&self, video_id: Uuid) -> StoreResult<EngagementPurge> {
        let mut comments = self.comments.lock().unwrap();
        let mut likes = self.likes.lock().unwrap();
        let (c, l) = (comments.len(), likes.len());
        comments.retain(|v| *v != video_id);
        likes.retain(|v| *v != video_id);
        Ok(EngagementPurge {
            comments: (c - comments.len()) as u64,
            likes: (l - likes.len()) as u64,
        })
    }

    async fn list_published(&self, query: &FeedQuery) -> StoreResult<FeedPage> {
        let mut matching: Vec<video::Model> = self
            .videos
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.is_published && v.status == VideoStatus::Completed)
            .filter(|v| {
                query
                    .query
                    .as_deref()
                    .map_or(true, |q| v.title.to_lowercase().contains(&q.to_lowercase()))
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            let ord = match query.sort_by {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::Views => a.views.cmp(&b.views),
                SortField::Duration => a.duration.total_cmp(&b.duration),
                SortField::Title => a.title.cmp(&b.title),
            };
            match query.sort_type {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = matching.len() as u64;
        let videos = matching
            .into_iter()
            .skip(((query.page - 1) * query.limit) as usize)
            .take(query.limit as usize)
            .collect();

        Ok(FeedPage {
            videos,
            total,
            page: query.page,
            limit: query.limit,
            total_pages: total.div_ceil(query.limit),
        })
    }

    async fn delete_expired(&self, cutoff: DateTime<FixedOffset>) -> StoreResult<Vec<Uuid>> {
        let mut videos = self.videos.lock().unwrap();
        let expired: Vec<Uuid> = videos
            .values()
            .filter(|v| v.status != VideoStatus::Completed && v.updated_at < cutoff)
            .map(|v| v.id)
            .collect();
        for id in &expired {
            videos.remove(id);
        }
        Ok(expired)
    }
}

#[derive(Default)]
pub struct InMemoryUsers {
    users: Mutex<HashMap<Uuid, user::Model>>,
}

impl InMemoryUsers {
    pub fn add(&self, email: &str) -> user::Model {
        let user = user::Model {
            id: Uuid::new_v4(),
            email: email.to_string(),
            username: email.split('@').next().unwrap_or(email).to_string(),
            created_at: store::now(),
        };
        self.users.lock().unwrap().insert(user.id, user.clone());
        user
    }
}

#[async_trait]
impl UserDirectory for InMemoryUsers {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<user::Model>> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
struct QueueState {
    wait: VecDeque<JobEnvelope>,
    active: HashMap<String, JobEnvelope>,
    delayed: Vec<(Instant, JobEnvelope)>,
    failed: Vec<JobEnvelope>,
    completed: usize,
}

/// Queue on tokio's clock so paused-time tests can step through backoff.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    pub reject_pushes: AtomicBool,
}

impl InMemoryQueue {
    pub fn waiting(&self) -> Vec<JobEnvelope> {
        self.state.lock().unwrap().wait.iter().cloned().collect()
    }

    pub fn failed(&self) -> Vec<JobEnvelope> {
        self.state.lock().unwrap().failed.clone()
    }

    pub fn completed(&self) -> usize {
        self.state.lock().unwrap().completed
    }

    pub fn delayed(&self) -> usize {
        self.state.lock().unwrap().delayed.len()
    }

    fn promote(state: &mut QueueState) -> usize {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = state.delayed.drain(..).partition(|(at, _)| *at <= now);
        state.delayed = pending;
        let moved = due.len();
        state.wait.extend(due.into_iter().map(|(_, env)| env));
        moved
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn push(&self, envelope: JobEnvelope) -> QueueResult<JobHandle> {
        if self.reject_pushes.load(Ordering::SeqCst) {
            return Err(QueueError::Redis(connection_refused()));
        }
        let id = envelope.id;
        self.state.lock().unwrap().wait.push_back(envelope);
        Ok(JobHandle { id })
    }

    async fn reserve(&self, wait: Duration) -> QueueResult<Option<ReservedJob>> {
        let next = {
            let mut state = self.state.lock().unwrap();
            Self::promote(&mut state);
            state.wait.pop_front().map(|envelope| {
                let receipt = Uuid::new_v4().to_string();
                state.active.insert(receipt.clone(), envelope.clone());
                ReservedJob::new(envelope, receipt)
            })
        };
        if next.is_none() && !wait.is_zero() {
            tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        }
        Ok(next)
    }

    async fn complete(&self, job: &ReservedJob) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(job.receipt());
        state.completed += 1;
        Ok(())
    }

    async fn retry_later(&self, job: &ReservedJob, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(job.receipt());
        state.delayed.push((Instant::now() + delay, job.envelope.clone()));
        Ok(())
    }

    async fn dead_letter(&self, job: &ReservedJob) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(job.receipt());
        state.failed.push(job.envelope.clone());
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        Ok(Self::promote(&mut self.state.lock().unwrap()))
    }

    async fn requeue_stalled(&self) -> QueueResult<usize> {
        let mut state = self.state.lock().unwrap();
        let stalled: Vec<JobEnvelope> = state.active.drain().map(|(_, env)| env).collect();
        let moved = stalled.len();
        state.wait.extend(stalled);
        Ok(moved)
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let state = self.state.lock().unwrap();
        Ok(QueueDepth {
            waiting: state.wait.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            failed: state.failed.len() as u64,
        })
    }
}

// ============================================================================
// Media store
// ============================================================================

/// Records every call; uploads read the local file so a missing temp file fails.
#[derive(Default)]
pub struct FakeMediaStore {
    /// Number of upcoming video uploads that fail.
    pub video_failures: AtomicU32,
    pub upload_attempts: Mutex<Vec<Instant>>,
    pub uploaded: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeMediaStore {
    pub fn failing(times: u32) -> Self {
        Self {
            video_failures: AtomicU32::new(times),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.upload_attempts.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    async fn read(path: &Path) -> Result<(), MediaError> {
        tokio::fs::metadata(path)
            .await
            .map(|_| ())
            .map_err(|source| MediaError::Read {
                path: path.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl MediaStore for FakeMediaStore {
    async fn upload_video(&self, local_path: &Path, video_id: Uuid) -> Result<UploadedMedia, MediaError> {
        self.upload_attempts.lock().unwrap().push(Instant::now());
        Self::read(local_path).await?;

        let remaining = self.video_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.video_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(MediaError::Upload {
                object: format!("videos/{}", video_id),
                message: "503 Service Unavailable".to_string(),
            });
        }

        let object = format!("videos/{}", video_id);
        self.uploaded.lock().unwrap().push(object.clone());
        Ok(UploadedMedia {
            url: format!("https://media.test/{}", object),
            duration: Some(12.5),
        })
    }

    async fn upload_image(&self, local_path: &Path, video_id: Uuid) -> Result<UploadedMedia, MediaError> {
        Self::read(local_path).await?;
        let object = format!("thumbnails/{}", video_id);
        self.uploaded.lock().unwrap().push(object.clone());
        Ok(UploadedMedia {
            url: format!("https://media.test/{}", object),
            duration: None,
        })
    }

    async fn delete_video(&self, video_id: Uuid) -> Result<(), MediaError> {
        self.deleted.lock().unwrap().push(format!("videos/{}", video_id));
        Ok(())
    }

    async fn delete_image(&self, video_id: Uuid) -> Result<(), MediaError> {
        self.deleted.lock().unwrap().push(format!("thumbnails/{}", video_id));
        Ok(())
    }
}

// ============================================================================
// Cache backend and notifier
// ============================================================================

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    pub down: AtomicBool,
}

impl MemoryCache {
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn put(&self, key: &str, value: &str) {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_string());
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::Redis(connection_refused()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String, _ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<EmailMessage>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: EmailMessage) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(message);
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Provider("401 Unauthorized".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Harness {
    pub videos: Arc<InMemoryVideoStore>,
    pub users: Arc<InMemoryUsers>,
    pub queue: Arc<InMemoryQueue>,
    pub media: Arc<FakeMediaStore>,
    pub cache_backend: Arc<MemoryCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub owner: user::Model,
    pub tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_media(FakeMediaStore::default())
    }

    pub fn with_media(media: FakeMediaStore) -> Self {
        let users = Arc::new(InMemoryUsers::default());
        let owner = users.add("owner@example.com");
        Self {
            videos: Arc::new(InMemoryVideoStore::default()),
            users,
            queue: Arc::new(InMemoryQueue::default()),
            media: Arc::new(media),
            cache_backend: Arc::new(MemoryCache::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            owner,
            tmp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn cache(&self) -> Cache {
        Cache::new(self.cache_backend.clone(), Duration::from_secs(300))
    }

    pub fn queue_client(&self) -> QueueClient {
        QueueClient::new(self.queue.clone(), JobOptions::default())
    }

    pub fn worker(&self) -> IngestionWorker {
        IngestionWorker::new(
            self.videos.clone(),
            self.media.clone(),
            self.cache(),
            self.notifier.clone(),
            self.queue.clone(),
        )
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.tmp.path().join("uploads")
    }

    pub fn limits(&self) -> UploadLimits {
        UploadLimits {
            tmp_dir: self.upload_dir(),
            max_video_bytes: 1024,
            max_thumbnail_bytes: 256,
        }
    }

    pub fn router(&self) -> axum::Router {
        api::routes(AppContext {
            videos: self.videos.clone(),
            users: self.users.clone(),
            queue: self.queue_client(),
            cache: self.cache(),
            limits: self.limits(),
        })
    }

    /// Writes a file into the upload directory, as the HTTP intake would.
    pub fn temp_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        std::fs::create_dir_all(self.upload_dir()).unwrap();
        let path = self.upload_dir().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn uploads_left(&self) -> usize {
        std::fs::read_dir(self.upload_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Completed records carry real media; everything else still holds placeholders.
    pub fn seed_video(&self, owner_id: Uuid, status: VideoStatus, is_published: bool) -> video::Model {
        let now = store::now();
        let id = Uuid::new_v4();
        let (video_file, thumbnail, duration) = if status == VideoStatus::Completed {
            (
                format!("https://media.test/videos/{}", id),
                format!("https://media.test/thumbnails/{}", id),
                30.0,
            )
        } else {
            (
                video::PLACEHOLDER_URL.to_string(),
                video::PLACEHOLDER_URL.to_string(),
                0.0,
            )
        };
        let model = video::Model {
            id,
            owner_id,
            title: "Morning run".to_string(),
            description: "Five laps around the lake".to_string(),
            video_file,
            thumbnail,
            duration,
            views: 0,
            is_published,
            status,
            created_at: now,
            updated_at: now,
        };
        self.videos.seed(model.clone());
        model
    }
}
