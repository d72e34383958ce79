use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use sea_orm::Database;
use streamify_server::api::{self, AppContext};
use streamify_server::cache::{Cache, RedisCache};
use streamify_server::config::Settings;
use streamify_server::migrator;
use streamify_server::queue::{QueueClient, RedisJobQueue};
use streamify_server::store::{SeaOrmUserDirectory, SeaOrmVideoStore};

#[tokio::main]
async fn main() {
    // Load .env if present (dotenvy)
    dotenvy::dotenv().ok();

    streamify_server::telemetry::init_telemetry("streamify-server");
    let settings = Settings::from_env();

    let (prometheus_layer, metric_handle) = axum_prometheus::PrometheusMetricLayer::pair();

    // Database Connection
    let db = Database::connect(&settings.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    use sea_orm_migration::MigratorTrait;
    migrator::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    // Redis Connection
    let redis_client = redis::Client::open(settings.redis_url.as_str()).expect("Invalid Redis URL");
    let cache_backend = RedisCache::connect(redis_client.clone())
        .await
        .expect("Failed to connect cache to Redis");
    let queue = RedisJobQueue::connect(redis_client, &settings.queue_name)
        .await
        .expect("Failed to connect queue to Redis");

    tokio::fs::create_dir_all(&settings.upload.tmp_dir)
        .await
        .expect("Failed to create upload directory");

    let ctx = AppContext {
        videos: Arc::new(SeaOrmVideoStore::new(db.clone())),
        users: Arc::new(SeaOrmUserDirectory::new(db)),
        queue: QueueClient::new(Arc::new(queue), settings.job_options),
        cache: Cache::new(Arc::new(cache_backend), settings.cache_ttl),
        limits: settings.upload.clone(),
    };

    let app = app(ctx, &settings, prometheus_layer, metric_handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    streamify_server::telemetry::shutdown_telemetry();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutting down server"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }
}

fn app(
    ctx: AppContext,
    settings: &Settings,
    prometheus_layer: axum_prometheus::PrometheusMetricLayer<'static>,
    metric_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Router {
    api::routes(ctx)
        .layer(prometheus_layer)
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<axum::body::Body>| {
                    let matched_path = request
                        .extensions()
                        .get::<axum::extract::MatchedPath>()
                        .map(|matched| matched.as_str());

                    // "METHOD /route", e.g. "PATCH /api/v1/videos/:id"
                    let span_name = if let Some(path) = matched_path {
                        format!("{} {}", request.method(), path)
                    } else {
                        format!("{} {}", request.method(), request.uri().path())
                    };

                    let user_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .or_else(|| {
                            request
                                .headers()
                                .get("x-real-ip")
                                .and_then(|v| v.to_str().ok())
                        })
                        .unwrap_or("unknown");

                    tracing::info_span!(
                        "request",
                        "otel.name" = span_name,
                        user_ip = user_ip,
                        method = ?request.method(),
                        uri = ?request.uri(),
                        // Filled in by handlers
                        action = tracing::field::Empty,
                        user_id = tracing::field::Empty,
                        user_email = tracing::field::Empty,
                        video_id = tracing::field::Empty,
                        business_event = tracing::field::Empty,
                        error = tracing::field::Empty,
                        status = tracing::field::Empty,
                        latency = tracing::field::Empty,
                    )
                })
                .on_request(|_request: &axum::http::Request<axum::body::Body>, _span: &tracing::Span| {})
                .on_response(|response: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                    span.record("status", tracing::field::display(response.status()));
                    span.record("latency", tracing::field::debug(latency));
                    tracing::info!("request completed");
                }),
        )
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(
                    settings
                        .cors_origin
                        .parse::<axum::http::HeaderValue>()
                        .expect("CORS_ORIGIN must be a valid header value"),
                )
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PATCH,
                    axum::http::Method::DELETE,
                ])
                .allow_headers([axum::http::header::CONTENT_TYPE])
                .allow_credentials(true),
        )
        .route("/metrics", get(|| async move { metric_handle.render() }))
}
