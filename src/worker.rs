use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::cache::{keys, Cache};
use crate::entities::{video, VideoStatus};
use crate::media::{MediaError, MediaStore};
use crate::notifications::{Notifier, NotificationTemplates};
use crate::queue::{
    self, DeleteJob, FailureDisposition, IngestionJob, JobEnvelope, JobQueue, PatchJob,
    QueueError, ReservedJob, UploadJob,
};
use crate::store::{StoreError, VideoChanges, VideoStore};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// What happened to a job after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying(Duration),
    Failed,
}

/// Executes ingestion jobs and applies the retry policy carried by each job.
pub struct IngestionWorker {
    videos: Arc<dyn VideoStore>,
    media: Arc<dyn MediaStore>,
    cache: Cache,
    notifier: Arc<dyn Notifier>,
    queue: Arc<dyn JobQueue>,
    templates: NotificationTemplates,
}

impl IngestionWorker {
    pub fn new(
        videos: Arc<dyn VideoStore>,
        media: Arc<dyn MediaStore>,
        cache: Cache,
        notifier: Arc<dyn Notifier>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            videos,
            media,
            cache,
            notifier,
            queue,
            templates: NotificationTemplates::new(),
        }
    }

    /// Reserves one job (waiting up to `wait`) and runs it. `None` when the queue was empty.
    pub async fn process_next(&self, wait: Duration) -> Result<Option<JobOutcome>, QueueError> {
        let Some(reserved) = self.queue.reserve(wait).await? else {
            return Ok(None);
        };
        Ok(Some(self.handle(reserved).await))
    }

    pub async fn handle(&self, reserved: ReservedJob) -> JobOutcome {
        let envelope = &reserved.envelope;
        let span = tracing::info_span!(
            "process_job",
            "otel.name" = "process_job",
            job_id = %envelope.id,
            kind = envelope.job.kind(),
            video_id = ?envelope.job.video_id(),
            attempt = envelope.current_attempt(),
        );
        span.set_parent(queue::parent_context(envelope));

        self.handle_reserved(reserved).instrument(span).await
    }

    async fn handle_reserved(&self, mut reserved: ReservedJob) -> JobOutcome {
        let kind = reserved.envelope.job.kind();
        let start = Instant::now();
        tracing::info!("job dequeued");

        let err = match self.execute(&reserved.envelope.job).await {
            Ok(()) => {
                crate::metrics::record_job_completed(kind, start.elapsed().as_secs_f64());
                if let Err(e) = self.queue.complete(&reserved).await {
                    tracing::error!(error = %e, "failed to acknowledge completed job");
                }
                tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "job completed");
                return JobOutcome::Completed;
            }
            Err(err) => err,
        };

        crate::metrics::record_job_attempt_failed(kind, start.elapsed().as_secs_f64());
        let message = err.to_string();

        match reserved.envelope.record_failure(&message) {
            FailureDisposition::RetryAfter(delay) => {
                tracing::warn!(
                    error = %message,
                    attempts_made = reserved.envelope.attempts_made,
                    retry_in_ms = delay.as_millis() as u64,
                    "job attempt failed, scheduling retry"
                );
                if let Err(e) = self.queue.retry_later(&reserved, delay).await {
                    // Left in the active list; requeued on the next worker start.
                    tracing::error!(error = %e, "failed to schedule retry");
                }
                JobOutcome::Retrying(delay)
            }
            FailureDisposition::Exhausted => {
                tracing::error!(
                    error = %message,
                    attempts_made = reserved.envelope.attempts_made,
                    "job failed permanently"
                );
                crate::metrics::increment_jobs_dead_lettered(kind);
                if let Err(e) = self.queue.dead_letter(&reserved).await {
                    tracing::error!(error = %e, "failed to move job to the failed list");
                }
                self.on_terminal_failure(&reserved.envelope).await;
                JobOutcome::Failed
            }
        }
    }

    pub async fn execute(&self, job: &IngestionJob) -> Result<(), JobError> {
        match job {
            IngestionJob::Upload(job) => self.upload(job).await,
            IngestionJob::Patch(job) => self.patch(job).await,
            IngestionJob::Delete(job) => self.delete(job).await,
            IngestionJob::Unknown => {
                tracing::warn!("dropping job of unknown kind");
                crate::metrics::increment_jobs_dropped("unknown_kind");
                Ok(())
            }
        }
    }

    async fn upload(&self, job: &UploadJob) -> Result<(), JobError> {
        let files = [job.video_path.as_path(), job.thumbnail_path.as_path()];

        let Some(current) = self.videos.find(job.video_id).await? else {
            return self.discard_orphan(job.video_id, &files, false).await;
        };
        if finalized_earlier(&current, &files).await {
            return Ok(());
        }

        let video = self.media.upload_video(&job.video_path, job.video_id).await?;
        let thumbnail = self.media.upload_image(&job.thumbnail_path, job.video_id).await?;

        let changes = VideoChanges {
            video_file: Some(video.url),
            thumbnail: Some(thumbnail.url),
            duration: Some(video.duration.unwrap_or(0.0)),
            is_published: Some(job.is_published),
            status: Some(VideoStatus::Completed),
            ..Default::default()
        };

        match self.videos.update(job.video_id, changes).await {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                return self.discard_orphan(job.video_id, &files, true).await;
            }
            Err(e) => return Err(e.into()),
        }

        self.cache.invalidate_all(&keys::for_video_write(job.video_id)).await;
        remove_temp_files(&files).await;
        tracing::info!(video_id = %job.video_id, "video published");
        Ok(())
    }

    async fn patch(&self, job: &PatchJob) -> Result<(), JobError> {
        let files: Vec<&Path> = job
            .video_path
            .iter()
            .chain(job.thumbnail_path.iter())
            .map(|p| p.as_path())
            .collect();

        let Some(current) = self.videos.find(job.video_id).await? else {
            return self.discard_orphan(job.video_id, &files, false).await;
        };
        if finalized_earlier(&current, &files).await {
            return Ok(());
        }

        let mut changes = VideoChanges {
            title: job.title.clone(),
            description: job.description.clone(),
            is_published: job.is_published,
            ..Default::default()
        };

        if let Some(path) = &job.video_path {
            let video = self.media.upload_video(path, job.video_id).await?;
            changes.video_file = Some(video.url);
            changes.duration = Some(video.duration.unwrap_or(0.0));
        }
        if let Some(path) = &job.thumbnail_path {
            let thumbnail = self.media.upload_image(path, job.video_id).await?;
            changes.thumbnail = Some(thumbnail.url);
        }

        let mut result = current;
        changes.apply(&mut result);
        if result.has_placeholder_media() {
            // The original upload still owns the transition to completed.
            tracing::warn!(video_id = %job.video_id, "media still pending after patch, status left as is");
        } else {
            changes.status = Some(VideoStatus::Completed);
        }

        match self.videos.update(job.video_id, changes).await {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                return self.discard_orphan(job.video_id, &files, true).await;
            }
            Err(e) => return Err(e.into()),
        }

        self.cache.invalidate_all(&keys::for_video_write(job.video_id)).await;
        remove_temp_files(&files).await;
        tracing::info!(video_id = %job.video_id, "video updated");
        Ok(())
    }

    async fn delete(&self, job: &DeleteJob) -> Result<(), JobError> {
        futures::try_join!(
            self.media.delete_video(job.video_id),
            self.media.delete_image(job.video_id),
        )?;

        let purged = self.videos.delete_engagement(job.video_id).await?;
        self.cache.invalidate_all(&keys::for_video_write(job.video_id)).await;

        tracing::info!(
            video_id = %job.video_id,
            comments = purged.comments,
            likes = purged.likes,
            "video media and engagement purged"
        );
        Ok(())
    }

    /// The record was deleted while its job was in flight: nothing left to finalize.
    async fn discard_orphan(&self, video_id: Uuid, files: &[&Path], uploaded: bool) -> Result<(), JobError> {
        tracing::warn!(%video_id, "video record no longer exists, discarding job");
        crate::metrics::increment_jobs_dropped("record_missing");

        if uploaded {
            if let Err(e) = futures::try_join!(
                self.media.delete_video(video_id),
                self.media.delete_image(video_id),
            ) {
                tracing::warn!(%video_id, error = %e, "failed to remove media of deleted video");
            }
        }
        remove_temp_files(files).await;
        Ok(())
    }

    /// Removes records stuck in `processing`/`failed` for longer than `expiry`
    /// and drops their cached copies.
    pub async fn sweep_expired(&self, expiry: Duration) -> u64 {
        let expiry = chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::seconds(420));
        let cutoff = crate::store::now() - expiry;

        let removed = match self.videos.delete_expired(cutoff).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "expiry sweep failed");
                return 0;
            }
        };
        if removed.is_empty() {
            return 0;
        }

        let stale: Vec<String> = removed.iter().map(|id| keys::video(*id)).collect();
        self.cache.invalidate_all(&stale).await;

        let n = removed.len() as u64;
        tracing::info!(removed = n, "expired unfinished videos");
        crate::metrics::increment_videos_expired(n);
        n
    }

    /// Runs once, on the attempt that exhausts the retry budget.
    async fn on_terminal_failure(&self, envelope: &JobEnvelope) {
        match &envelope.job {
            IngestionJob::Upload(job) => {
                self.fail_video(
                    job.video_id,
                    job.owner_email.as_deref(),
                    "upload",
                    &job.title,
                    envelope,
                )
                .await;
            }
            IngestionJob::Patch(job) => {
                self.fail_video(
                    job.video_id,
                    job.owner_email.as_deref(),
                    "update",
                    job.title.as_deref().unwrap_or("your video"),
                    envelope,
                )
                .await;
            }
            IngestionJob::Delete(job) => {
                tracing::error!(video_id = %job.video_id, "remote media and engagement of deleted video were not purged");
            }
            IngestionJob::Unknown => {}
        }
    }

    async fn fail_video(
        &self,
        video_id: Uuid,
        owner_email: Option<&str>,
        action: &str,
        title: &str,
        envelope: &JobEnvelope,
    ) {
        let flipped = match self.videos.mark_failed(video_id).await {
            Ok(true) => {
                tracing::info!(%video_id, "video marked as failed");
                true
            }
            Ok(false) => {
                tracing::warn!(%video_id, "video missing or no longer processing, status left as is");
                false
            }
            Err(e) => {
                tracing::error!(%video_id, error = %e, "failed to mark video as failed");
                true
            }
        };
        self.cache.invalidate_all(&keys::for_video_write(video_id)).await;

        // Another delivery already settled the record; the owner has nothing to hear about.
        if flipped {
            if let Some(to) = owner_email {
                self.notify_owner(to, action, title, video_id, envelope.attempts_made).await;
            }
        }

        remove_temp_files(&envelope.job.temp_files()).await;
    }

    async fn notify_owner(&self, to: &str, action: &str, title: &str, video_id: Uuid, attempts: u32) {
        let message = match self
            .templates
            .processing_failed(to, action, title, &video_id.to_string(), attempts)
        {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "failed to render failure email");
                return;
            }
        };

        if let Err(e) = self.notifier.send(message).await {
            tracing::warn!(%video_id, error = %e, "failure notification not delivered");
        }
    }
}

/// A redelivered job whose record is already finalized and whose temp files
/// were consumed by the earlier run has nothing left to do.
async fn finalized_earlier(current: &video::Model, files: &[&Path]) -> bool {
    if current.status != VideoStatus::Completed || current.has_placeholder_media() {
        return false;
    }
    let mut consumed = false;
    for path in files {
        if matches!(tokio::fs::try_exists(path).await, Ok(false)) {
            consumed = true;
        }
    }
    if consumed {
        tracing::info!(video_id = %current.id, "video already finalized by an earlier delivery");
        crate::metrics::increment_jobs_dropped("already_finalized");
        remove_temp_files(files).await;
    }
    consumed
}

/// Deletes local upload files. Already-missing files are fine.
pub async fn remove_temp_files(paths: &[&Path]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "temp file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove temp file"),
        }
    }
}

// ============================================================================
// Background loops
// ============================================================================

/// Handle over every background task started by [`start_workers`].
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Signals all loops to stop and waits for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub queue_name: String,
    pub reserve_wait: Duration,
    pub promote_interval: Duration,
    pub monitor_interval: Duration,
    pub sweep_interval: Duration,
    pub record_expiry: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            queue_name: "video-processing".to_string(),
            reserve_wait: Duration::from_secs(2),
            promote_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(60),
            record_expiry: Duration::from_secs(420),
        }
    }
}

pub fn start_workers(worker: Arc<IngestionWorker>, queue: Arc<dyn JobQueue>, config: PoolConfig) -> WorkerPool {
    let (shutdown, rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(config.concurrency + 3);

    for i in 0..config.concurrency {
        tasks.push(spawn_consumer(i, worker.clone(), config.reserve_wait, rx.clone()));
    }
    tasks.push(spawn_delayed_promoter(queue.clone(), config.promote_interval, rx.clone()));
    tasks.push(spawn_queue_monitor(
        queue,
        config.queue_name.clone(),
        config.monitor_interval,
        rx.clone(),
    ));
    tasks.push(spawn_expiry_sweeper(
        worker,
        config.record_expiry,
        config.sweep_interval,
        rx,
    ));

    WorkerPool { shutdown, tasks }
}

fn spawn_consumer(
    i: usize,
    worker: Arc<IngestionWorker>,
    reserve_wait: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Worker {} started", i);
        while !*shutdown.borrow() {
            if let Err(e) = worker.process_next(reserve_wait).await {
                tracing::error!("Worker {}: queue error: {}", i, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        tracing::info!("Worker {} stopped", i);
    })
}

/// Runs `tick` every `interval` until shutdown is signalled.
fn spawn_periodic<F, Fut>(interval: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

fn spawn_delayed_promoter(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic(interval, shutdown, move || {
        let queue = queue.clone();
        async move {
            match queue.promote_due().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(promoted = n, "delayed jobs ready for retry"),
                Err(e) => tracing::error!(error = %e, "failed to promote delayed jobs"),
            }
        }
    })
}

fn spawn_queue_monitor(
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tracing::info!("Queue Monitor started");
    spawn_periodic(interval, shutdown, move || {
        let queue = queue.clone();
        let queue_name = queue_name.clone();
        async move {
            match queue.depth().await {
                Ok(depth) => crate::metrics::set_queue_depth(&queue_name, &depth),
                Err(e) => tracing::error!("Failed to read queue depth: {}", e),
            }
        }
    })
}

fn spawn_expiry_sweeper(
    worker: Arc<IngestionWorker>,
    expiry: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic(interval, shutdown, move || {
        let worker = worker.clone();
        async move {
            worker.sweep_expired(expiry).await;
        }
    })
}
