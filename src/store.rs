//! Record store: the durable home of video records.
//!
//! The pipeline only needs CRUD by id, `$set`-style partial updates and a
//! couple of bulk deletes, so the surface is kept to the [`VideoStore`] trait.
//! [`SeaOrmVideoStore`] is the Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::Unchanged, ColumnTrait, Condition,
    DatabaseConnection, DbErr, EntityTrait, ModelTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, UpdateMany,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entities::{comment, like, user, video, VideoStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("video {0} not found")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields to overwrite on a record. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub video_file: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub is_published: Option<bool>,
    pub status: Option<VideoStatus>,
}

impl VideoChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the changes to an in-memory model and bumps `updated_at`.
    pub fn apply(&self, model: &mut video::Model) {
        if let Some(title) = &self.title {
            model.title = title.clone();
        }
        if let Some(description) = &self.description {
            model.description = description.clone();
        }
        if let Some(url) = &self.video_file {
            model.video_file = url.clone();
        }
        if let Some(url) = &self.thumbnail {
            model.thumbnail = url.clone();
        }
        if let Some(duration) = self.duration {
            model.duration = duration;
        }
        if let Some(is_published) = self.is_published {
            model.is_published = is_published;
        }
        if let Some(status) = self.status {
            model.status = status;
        }
        model.updated_at = now();
    }

    fn into_active_model(self, id: Uuid) -> video::ActiveModel {
        let mut active = video::ActiveModel {
            id: Unchanged(id),
            updated_at: Set(now()),
            ..Default::default()
        };
        if let Some(title) = self.title {
            active.title = Set(title);
        }
        if let Some(description) = self.description {
            active.description = Set(description);
        }
        if let Some(url) = self.video_file {
            active.video_file = Set(url);
        }
        if let Some(url) = self.thumbnail {
            active.thumbnail = Set(url);
        }
        if let Some(duration) = self.duration {
            active.duration = Set(duration);
        }
        if let Some(is_published) = self.is_published {
            active.is_published = Set(is_published);
        }
        if let Some(status) = self.status {
            active.status = Set(status);
        }
        active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    CreatedAt,
    Views,
    Duration,
    Title,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "createdAt",
            SortField::Views => "views",
            SortField::Duration => "duration",
            SortField::Title => "title",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Shape of a feed read: pagination, title filter and sort.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedQuery {
    pub page: u64,
    pub limit: u64,
    pub query: Option<String>,
    pub sort_by: SortField,
    pub sort_type: SortOrder,
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 10,
            query: None,
            sort_by: SortField::CreatedAt,
            sort_type: SortOrder::Desc,
        }
    }
}

impl FeedQuery {
    pub const MAX_LIMIT: u64 = 50;

    /// Clamps page/limit into range and drops blank search terms.
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.limit = self.limit.clamp(1, Self::MAX_LIMIT);
        self.query = self
            .query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub videos: Vec<video::Model>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngagementPurge {
    pub comments: u64,
    pub likes: u64,
}

#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn insert(&self, video: video::Model) -> StoreResult<video::Model>;

    async fn find(&self, id: Uuid) -> StoreResult<Option<video::Model>>;

    /// Partial update. Fails with [`StoreError::NotFound`] when the record is gone.
    async fn update(&self, id: Uuid, changes: VideoChanges) -> StoreResult<video::Model>;

    /// Flips `processing` to `failed`. Returns false when the record is missing
    /// or already left `processing`.
    async fn mark_failed(&self, id: Uuid) -> StoreResult<bool>;

    async fn delete(&self, id: Uuid) -> StoreResult<Option<video::Model>>;

    /// Removes comments and likes that reference the video.
    async fn delete_engagement(&self, video_id: Uuid) -> StoreResult<EngagementPurge>;

    async fn list_published(&self, query: &FeedQuery) -> StoreResult<FeedPage>;

    /// Deletes `processing`/`failed` records whose last transition is older than `cutoff`.
    /// Returns the ids of the removed records.
    async fn delete_expired(&self, cutoff: DateTime<FixedOffset>) -> StoreResult<Vec<Uuid>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<user::Model>>;
}

pub fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

pub struct SeaOrmVideoStore {
    db: DatabaseConnection,
}

impl SeaOrmVideoStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VideoStore for SeaOrmVideoStore {
    async fn insert(&self, video: video::Model) -> StoreResult<video::Model> {
        let active: video::ActiveModel = video.into();
        Ok(active.insert(&self.db).await?)
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<video::Model>> {
        Ok(video::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn update(&self, id: Uuid, changes: VideoChanges) -> StoreResult<video::Model> {
        match changes.into_active_model(id).update(&self.db).await {
            Ok(model) => Ok(model),
            Err(DbErr::RecordNotUpdated) | Err(DbErr::RecordNotFound(_)) => {
                Err(StoreError::NotFound(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_failed(&self, id: Uuid) -> StoreResult<bool> {
        let res = mark_failed_query(id).exec(&self.db).await?;
        Ok(res.rows_affected > 0)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<Option<video::Model>> {
        let Some(existing) = video::Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        let res = existing.clone().delete(&self.db).await?;
        Ok((res.rows_affected > 0).then_some(existing))
    }

    async fn delete_engagement(&self, video_id: Uuid) -> StoreResult<EngagementPurge> {
        let comments = comment::Entity::delete_many()
            .filter(comment::Column::VideoId.eq(video_id))
            .exec(&self.db)
            .await?;
        let likes = like::Entity::delete_many()
            .filter(like::Column::VideoId.eq(video_id))
            .exec(&self.db)
            .await?;
        Ok(EngagementPurge {
            comments: comments.rows_affected,
            likes: likes.rows_affected,
        })
    }

    async fn list_published(&self, query: &FeedQuery) -> StoreResult<FeedPage> {
        let mut select = video::Entity::find()
            .filter(video::Column::IsPublished.eq(true))
            .filter(video::Column::Status.eq(VideoStatus::Completed));

        if let Some(term) = &query.query {
            select = select.filter(video::Column::Title.contains(term.as_str()));
        }

        let column = match query.sort_by {
            SortField::CreatedAt => video::Column::CreatedAt,
            SortField::Views => video::Column::Views,
            SortField::Duration => video::Column::Duration,
            SortField::Title => video::Column::Title,
        };
        select = match query.sort_type {
            SortOrder::Asc => select.order_by_asc(column),
            SortOrder::Desc => select.order_by_desc(column),
        };

        let paginator = select.paginate(&self.db, query.limit);
        let totals = paginator.num_items_and_pages().await?;
        let videos = paginator.fetch_page(query.page - 1).await?;

        Ok(FeedPage {
            videos,
            total: totals.number_of_items,
            page: query.page,
            limit: query.limit,
            total_pages: totals.number_of_pages,
        })
    }

    async fn delete_expired(&self, cutoff: DateTime<FixedOffset>) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = video::Entity::find()
            .select_only()
            .column(video::Column::Id)
            .filter(expired(cutoff))
            .into_tuple()
            .all(&self.db)
            .await?;
        if ids.is_empty() {
            return Ok(ids);
        }

        // Re-check the condition so a record finalized in between survives.
        video::Entity::delete_many()
            .filter(expired(cutoff))
            .filter(video::Column::Id.is_in(ids.clone()))
            .exec(&self.db)
            .await?;
        Ok(ids)
    }
}

/// `processing` -> `failed`, and nothing else.
fn mark_failed_query(id: Uuid) -> UpdateMany<video::Entity> {
    video::Entity::update_many()
        .col_expr(video::Column::Status, Expr::value(VideoStatus::Failed))
        .col_expr(video::Column::UpdatedAt, Expr::value(now()))
        .filter(video::Column::Id.eq(id))
        .filter(video::Column::Status.eq(VideoStatus::Processing))
}

fn expired(cutoff: DateTime<FixedOffset>) -> Condition {
    Condition::all()
        .add(video::Column::Status.is_in([VideoStatus::Processing, VideoStatus::Failed]))
        .add(video::Column::UpdatedAt.lt(cutoff))
}

pub struct SeaOrmUserDirectory {
    db: DatabaseConnection,
}

impl SeaOrmUserDirectory {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserDirectory for SeaOrmUserDirectory {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<user::Model>> {
        Ok(user::Entity::find_by_id(id).one(&self.db).await?)
    }
}
