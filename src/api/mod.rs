pub mod middleware;
pub mod upload;
pub mod video;

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Router};

use crate::cache::Cache;
use crate::config::UploadLimits;
use crate::queue::QueueClient;
use crate::store::{UserDirectory, VideoStore};

/// Shared handles every request handler reads from.
#[derive(Clone)]
pub struct AppContext {
    pub videos: Arc<dyn VideoStore>,
    pub users: Arc<dyn UserDirectory>,
    pub queue: QueueClient,
    pub cache: Cache,
    pub limits: UploadLimits,
}

impl AppContext {
    pub fn cache_ttl(&self) -> Duration {
        self.cache.default_ttl()
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Application routes, without the transport layers (tracing, CORS, metrics).
pub fn routes(ctx: AppContext) -> Router {
    let body_limit = ctx.limits.body_limit();

    let protected_routes = Router::new()
        .route(
            "/api/v1/videos",
            get(video::list_videos).post(video::publish_video),
        )
        .route(
            "/api/v1/videos/:id",
            get(video::get_video)
                .patch(video::update_video)
                .delete(video::delete_video),
        )
        .route_layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(ctx))
        .layer(tower_cookies::CookieManagerLayer::new())
}
