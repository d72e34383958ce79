use std::sync::Arc;

use sea_orm::Database;
use streamify_server::cache::{Cache, RedisCache};
use streamify_server::config::Settings;
use streamify_server::media::GcsMediaStore;
use streamify_server::notifications::SendGridNotifier;
use streamify_server::queue::{JobQueue, RedisJobQueue};
use streamify_server::store::{SeaOrmVideoStore, VideoStore};
use streamify_server::worker::{self, IngestionWorker, PoolConfig};

#[tokio::main]
async fn main() {
    // Load .env if present (dotenvy)
    dotenvy::dotenv().ok();

    streamify_server::telemetry::init_telemetry("streamify-worker");
    let settings = Settings::from_env();

    let (prometheus_layer, metric_handle) = axum_prometheus::PrometheusMetricLayer::pair();

    // Spawn metrics server
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route(
                "/metrics",
                axum::routing::get(|| async move { metric_handle.render() }),
            )
            .layer(prometheus_layer);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 9091));
        tracing::info!("Metrics server listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    // Database Connection
    let db = Database::connect(&settings.database_url)
        .await
        .expect("Failed to connect to database");

    // Redis Connection
    let redis_client = redis::Client::open(settings.redis_url.as_str()).expect("Invalid Redis URL");
    let cache_backend = RedisCache::connect(redis_client.clone())
        .await
        .expect("Failed to connect cache to Redis");
    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisJobQueue::connect(redis_client, &settings.queue_name)
            .await
            .expect("Failed to connect queue to Redis"),
    );

    // GCS Client
    let gcs_config = google_cloud_storage::client::ClientConfig::default()
        .with_auth()
        .await
        .expect("Failed to load GCS credentials");
    let gcs_client = google_cloud_storage::client::Client::new(gcs_config);

    let videos: Arc<dyn VideoStore> = Arc::new(SeaOrmVideoStore::new(db));
    let ingestion = Arc::new(IngestionWorker::new(
        videos,
        Arc::new(GcsMediaStore::new(gcs_client, settings.media.clone())),
        Cache::new(Arc::new(cache_backend), settings.cache_ttl),
        Arc::new(SendGridNotifier::new(
            settings.sendgrid_api_key.clone(),
            settings.email_from.clone(),
        )),
        queue.clone(),
    ));

    match queue.requeue_stalled().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!("Requeued {} jobs left active by a previous worker", n),
        Err(e) => tracing::error!("Failed to requeue stalled jobs: {}", e),
    }

    tracing::info!("Starting background worker...");

    let pool = worker::start_workers(
        ingestion,
        queue,
        PoolConfig {
            concurrency: settings.worker_concurrency,
            queue_name: settings.queue_name.clone(),
            record_expiry: settings.record_expiry,
            ..PoolConfig::default()
        },
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutting down worker process"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }

    pool.shutdown().await;
    streamify_server::telemetry::shutdown_telemetry();
}
