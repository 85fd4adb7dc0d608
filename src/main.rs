use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use recipe_extract::app_state::AppState;
use recipe_extract::config::AppConfig;
use recipe_extract::db::{self, PgJobStore, PgRecipeRepository};
use recipe_extract::routes;
use recipe_extract::services::{
    cache::RedisResultCache,
    cancellation::{run_listener, Backoff, CancelChannel, RedisCancelChannel},
    downloader::YtDlpDownloader,
    exporter::FileExporter,
    orchestrator::{Orchestrator, OrchestratorSettings},
    pipeline::{Collaborators, PipelineSettings},
    quota::QuotaPolicy,
    staging::StagingArea,
    workers_ai::WorkersAiClient,
};

/// How long in-flight jobs get to record their terminal state after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing recipe-extract server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.pool_settings())
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis result cache");
    let cache = Arc::new(
        RedisResultCache::new(&config.redis_url, config.cache_ttl())
            .expect("Failed to initialize result cache"),
    );
    let bus: Arc<dyn CancelChannel> = Arc::new(
        RedisCancelChannel::new(&config.redis_url, config.cancel_channel.clone())
            .expect("Failed to initialize cancellation channel"),
    );

    tracing::info!("Initializing Cloudflare Workers AI client");
    let ai = Arc::new(
        WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token)
            .expect("Failed to initialize Workers AI client"),
    );

    let downloader = Arc::new(YtDlpDownloader::detect(&config.yt_dlp_path).await);

    let staging = StagingArea::new(&config.staging_dir);
    staging
        .ensure()
        .await
        .expect("Failed to create staging directory");
    tokio::fs::create_dir_all(&config.export_dir)
        .await
        .expect("Failed to create export directory");

    let exporter = Arc::new(FileExporter::new(&config.export_dir, &config.public_base_url));

    let shutdown = CancellationToken::new();
    let deps = Collaborators {
        store: Arc::new(PgJobStore::new(db_pool.clone())),
        cache: cache.clone(),
        recipes: Arc::new(PgRecipeRepository::new(db_pool.clone())),
        extractor: ai.clone(),
        enricher: Some(ai.clone()),
        downloader,
        exporter: exporter.clone(),
        staging: staging.clone(),
    };
    let settings = OrchestratorSettings {
        heavy_concurrency: config.heavy_job_concurrency,
        light_concurrency: config.light_job_concurrency,
        heavy_timeout: config.heavy_job_timeout(),
        light_timeout: config.light_job_timeout(),
        quota: QuotaPolicy {
            free_limit: config.free_monthly_extractions,
            premium_limit: config.premium_monthly_extractions,
        },
        pipeline: PipelineSettings {
            enrichment_min_confidence: config.enrichment_min_confidence,
            native_video_platforms: config.native_video_platforms(),
        },
    };
    let orchestrator = Orchestrator::new(deps, bus.clone(), settings, shutdown.clone());

    // Cross-instance cancellation listener
    let listener_task = tokio::spawn(run_listener(
        bus,
        orchestrator.registry().clone(),
        shutdown.clone(),
        Backoff::default(),
    ));

    // Orphaned jobs from stopped instances, expired exports
    let housekeeping_task = tokio::spawn(run_housekeeping(
        orchestrator.clone(),
        exporter,
        config.export_retention(),
        shutdown.clone(),
    ));

    let state = AppState::new(
        db_pool,
        orchestrator.clone(),
        cache,
        ai,
        staging,
    );

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/extract", post(routes::extract::submit_extraction))
        .route("/api/v1/extract/images", post(routes::extract::submit_images))
        .route(
            "/api/v1/recipes/{recipe_id}/export",
            post(routes::extract::export_recipe),
        )
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job_status))
        .route("/api/v1/jobs/{job_id}/cancel", post(routes::jobs::cancel_job))
        .with_state(state)
        .nest_service("/exports", ServeDir::new(&config.export_dir))
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::health::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    tokio::spawn(shutdown_signal(shutdown.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .expect("Server error");

    // Jobs observe the cancelled shutdown token at their next checkpoint.
    let registry = orchestrator.registry();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = registry.len(), "Jobs still running at shutdown");
    }
    listener_task.abort();
    housekeeping_task.abort();
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}

/// Runs once at start-up, then every [`HOUSEKEEPING_INTERVAL`] until shutdown.
async fn run_housekeeping(
    orchestrator: Orchestrator,
    exporter: Arc<FileExporter>,
    export_retention: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Err(e) = orchestrator.sweep_orphaned().await {
            tracing::warn!(error = %e, "Orphaned job sweep failed");
        }
        match exporter.remove_expired(export_retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Removed expired exports"),
            Err(e) => tracing::warn!(error = %e, "Export cleanup failed"),
        }
    }
}

fn describe_metrics() {
    metrics::describe_counter!(
        "extraction_jobs_admitted_total",
        "Extraction jobs created and started"
    );
    metrics::describe_counter!(
        "extraction_jobs_deduplicated_total",
        "Requests resolved to an existing job"
    );
    metrics::describe_counter!(
        "extraction_jobs_completed_total",
        "Extraction jobs completed"
    );
    metrics::describe_counter!(
        "extraction_jobs_failed_total",
        "Extraction jobs failed, by error code"
    );
    metrics::describe_counter!(
        "extraction_jobs_cancelled_total",
        "Extraction jobs cancelled by request"
    );
    metrics::describe_counter!("extraction_cache_hits_total", "Result cache hits");
    metrics::describe_counter!("extraction_cache_misses_total", "Result cache misses");
    metrics::describe_counter!(
        "cancellation_messages_received_total",
        "Cancellation broadcasts received from the shared channel"
    );
    metrics::describe_histogram!(
        "extraction_job_seconds",
        "Time from job start to its terminal write"
    );
    metrics::describe_gauge!(
        "extraction_jobs_running",
        "Jobs currently holding a concurrency slot"
    );
}
