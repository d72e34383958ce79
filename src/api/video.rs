use axum::{
    extract::{Extension, Multipart, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::middleware::CurrentUser;
use super::upload::VideoForm;
use super::AppContext;
use crate::cache::keys;
use crate::entities::{video, VideoStatus};
use crate::error::{AppError, AppResult};
use crate::queue::{DeleteJob, IngestionJob, JobHandle, PatchJob, UploadJob};
use crate::store::{FeedPage, FeedQuery, VideoChanges};
use crate::worker::remove_temp_files;

fn accepted(handle: JobHandle, video_id: Uuid) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": handle.id, "videoId": video_id })),
    )
        .into_response()
}

fn not_found() -> AppError {
    AppError::NotFound("Video not found".to_string())
}

/// Loads `id` and checks that `user` owns it.
async fn owned_video(ctx: &AppContext, user: &CurrentUser, id: Uuid, action: &str) -> AppResult<video::Model> {
    let video = ctx.videos.find(id).await?.ok_or_else(not_found)?;
    if video.owner_id != user.id {
        return Err(AppError::Unauthorized(format!(
            "You are not allowed to {} this video",
            action
        )));
    }
    Ok(video)
}

pub async fn publish_video(
    Extension(ctx): Extension<AppContext>,
    Extension(user): Extension<CurrentUser>,
    multipart: Multipart,
) -> AppResult<Response> {
    let span = tracing::Span::current();
    span.record("action", "publish_video");

    let form = VideoForm::read(multipart, &ctx.limits).await?;
    let upload = match form.into_new_upload() {
        Ok(upload) => upload,
        Err(rejected) => return Err(rejected.discard().await),
    };
    let temp_files = [upload.video.path.as_path(), upload.thumbnail.path.as_path()];

    let now = crate::store::now();
    let placeholder = video::Model {
        id: Uuid::new_v4(),
        owner_id: user.id,
        title: upload.title.clone(),
        description: upload.description.clone(),
        video_file: video::PLACEHOLDER_URL.to_string(),
        thumbnail: video::PLACEHOLDER_URL.to_string(),
        duration: 0.0,
        views: 0,
        is_published: upload.is_published,
        status: VideoStatus::Processing,
        created_at: now,
        updated_at: now,
    };

    let record = match ctx.videos.insert(placeholder).await {
        Ok(record) => record,
        Err(e) => {
            remove_temp_files(&temp_files).await;
            return Err(e.into());
        }
    };
    span.record("video_id", tracing::field::display(record.id));

    let job = IngestionJob::Upload(UploadJob {
        video_id: record.id,
        video_path: upload.video.path.clone(),
        thumbnail_path: upload.thumbnail.path.clone(),
        title: record.title.clone(),
        is_published: upload.is_published,
        owner_email: Some(user.email.clone()),
    });

    let handle = match ctx.queue.enqueue(job).await {
        Ok(handle) => handle,
        Err(e) => {
            // No job will ever finalize this record.
            if let Err(rollback) = ctx.videos.delete(record.id).await {
                tracing::error!(video_id = %record.id, error = %rollback, "failed to roll back placeholder");
            }
            remove_temp_files(&temp_files).await;
            return Err(e.into());
        }
    };

    ctx.cache.invalidate(&keys::feed_first_page()).await;
    span.record("business_event", "video_upload_accepted");
    tracing::info!(
        video_id = %record.id,
        job_id = %handle.id,
        video_bytes = upload.video.size,
        thumbnail_bytes = upload.thumbnail.size,
        "upload accepted"
    );

    Ok(accepted(handle, record.id))
}

pub async fn update_video(
    Extension(ctx): Extension<AppContext>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<Response> {
    let span = tracing::Span::current();
    span.record("action", "update_video")
        .record("video_id", tracing::field::display(id));

    let existing = owned_video(&ctx, &user, id, "update").await?;

    let form = VideoForm::read(multipart, &ctx.limits).await?;
    let edit = match form.into_edit() {
        Ok(edit) => edit,
        Err(rejected) => return Err(rejected.discard().await),
    };

    if edit.has_files() {
        if let Some(field) = edit.unresolved_media(&existing) {
            remove_temp_files(&edit.temp_files()).await;
            return Err(AppError::validation(format!(
                "{} is required: this video has not been processed yet",
                field
            )));
        }
    }

    let mut changes = VideoChanges {
        title: edit.title.clone(),
        description: edit.description.clone(),
        is_published: edit.is_published,
        ..Default::default()
    };

    if !edit.has_files() {
        let updated = if changes.is_empty() {
            existing
        } else {
            ctx.videos.update(id, changes).await?
        };
        ctx.cache.invalidate_all(&keys::for_video_write(id)).await;
        span.record("business_event", "video_updated");
        return Ok((StatusCode::OK, Json(updated)).into_response());
    }

    changes.status = Some(VideoStatus::Processing);
    if let Err(e) = ctx.videos.update(id, changes).await {
        remove_temp_files(&edit.temp_files()).await;
        return Err(e.into());
    }

    let job = IngestionJob::Patch(PatchJob {
        video_id: id,
        video_path: edit.video.as_ref().map(|f| f.path.clone()),
        thumbnail_path: edit.thumbnail.as_ref().map(|f| f.path.clone()),
        title: edit.title.clone().or_else(|| Some(existing.title.clone())),
        description: edit.description.clone(),
        is_published: edit.is_published,
        owner_email: Some(user.email.clone()),
    });

    let handle = match ctx.queue.enqueue(job).await {
        Ok(handle) => handle,
        Err(e) => {
            let revert = VideoChanges {
                status: Some(existing.status),
                ..Default::default()
            };
            if let Err(rollback) = ctx.videos.update(id, revert).await {
                tracing::error!(video_id = %id, error = %rollback, "failed to restore video status");
            }
            remove_temp_files(&edit.temp_files()).await;
            ctx.cache.invalidate_all(&keys::for_video_write(id)).await;
            return Err(e.into());
        }
    };

    ctx.cache.invalidate_all(&keys::for_video_write(id)).await;
    span.record("business_event", "video_patch_accepted");
    tracing::info!(video_id = %id, job_id = %handle.id, "media replacement accepted");

    Ok(accepted(handle, id))
}

pub async fn delete_video(
    Extension(ctx): Extension<AppContext>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<video::Model>> {
    let span = tracing::Span::current();
    span.record("action", "delete_video")
        .record("video_id", tracing::field::display(id));

    owned_video(&ctx, &user, id, "delete").await?;

    let deleted = ctx.videos.delete(id).await?.ok_or_else(not_found)?;

    match ctx.queue.enqueue(IngestionJob::Delete(DeleteJob { video_id: id })).await {
        Ok(handle) => tracing::info!(video_id = %id, job_id = %handle.id, "video deleted"),
        Err(e) => {
            // The record is gone either way; only the remote purge is lost.
            tracing::error!(video_id = %id, error = %e, "failed to enqueue media purge");
        }
    }

    ctx.cache.invalidate_all(&keys::for_video_write(id)).await;
    span.record("business_event", "video_deleted");

    Ok(Json(deleted))
}

pub async fn list_videos(
    Extension(ctx): Extension<AppContext>,
    Query(query): Query<FeedQuery>,
) -> AppResult<Json<FeedPage>> {
    tracing::Span::current().record("action", "list_videos");

    let query = query.normalized();
    let key = keys::feed(&query);
    let videos = ctx.videos.clone();

    let page = ctx
        .cache
        .get_cached(&key, ctx.cache_ttl(), || async move {
            videos.list_published(&query).await
        })
        .await?;

    Ok(Json(page))
}

pub async fn get_video(
    Extension(ctx): Extension<AppContext>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<video::Model>> {
    tracing::Span::current()
        .record("action", "get_video")
        .record("video_id", tracing::field::display(id));

    let videos = ctx.videos.clone();
    let video = ctx
        .cache
        .get_cached(&keys::video(id), ctx.cache_ttl(), || async move {
            videos.find(id).await
        })
        .await?
        .ok_or_else(not_found)?;

    let visible = video.owner_id == user.id
        || (video.is_published && video.status == VideoStatus::Completed);
    if !visible {
        return Err(not_found());
    }

    Ok(Json(video))
}

