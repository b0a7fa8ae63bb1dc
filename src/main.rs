//! cdrflow call-event pipeline
//!
//! Consumes call start/stop events from the primary and retry queues,
//! validates them, stores starts and merges stops into completed call
//! records. Failed events climb the retry ladder towards the rejected queue.
//! A small HTTP server exposes health and pipeline counters.

use actix_web::{web, App, HttpResponse, HttpServer};
use cdrflow_core::models::QueueStage;
use cdrflow_core::traits::{CallDocumentStore, EventTransport};
use cdrflow_core::AppConfig;
use cdrflow_db::{create_pool, ensure_schema, PgCallDocumentRepository};
use cdrflow_queue::RedisQueueTransport;
use cdrflow_services::{EventConsumer, PipelineStats, ReconciliationEngine};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shared state of the HTTP handlers
struct AppState {
    store: Arc<PgCallDocumentRepository>,
    transport: Arc<RedisQueueTransport>,
    stats: Arc<PipelineStats>,
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let database = state.store.health_check().await;
    let queue = state.transport.health_check().await;

    let status = |result: &cdrflow_core::AppResult<()>| match result {
        Ok(()) => "up".to_string(),
        Err(e) => format!("down: {}", e),
    };
    let body = serde_json::json!({
        "status": if database.is_ok() && queue.is_ok() { "healthy" } else { "degraded" },
        "service": "cdrflow",
        "version": env!("CARGO_PKG_VERSION"),
        "database": status(&database),
        "queue": status(&queue),
    });

    if database.is_ok() && queue.is_ok() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Pipeline counters and queue depths
async fn pipeline_stats(state: web::Data<AppState>) -> HttpResponse {
    let depths = match state.transport.queue_depths().await {
        Ok(depths) => serde_json::Value::Object(
            depths
                .into_iter()
                .map(|(queue, len)| (queue, serde_json::Value::from(len)))
                .collect(),
        ),
        Err(e) => {
            warn!("Failed to read queue depths: {}", e);
            serde_json::Value::Null
        }
    };

    HttpResponse::Ok().json(serde_json::json!({
        "pipeline": state.stats.snapshot(),
        "queues": depths,
    }))
}

/// Configure API routes
fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health_check))
            .route("/stats", web::get().to(pipeline_stats)),
    );
}

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cdrflow={},cdrflow_core={},cdrflow_services={},cdrflow_db={},cdrflow_queue={},actix_web=info,sqlx=warn",
            log_level, log_level, log_level, log_level, log_level
        ))
    });

    let json = env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    init_tracing();

    info!("Starting cdrflow v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;

    info!("Connecting to database...");
    let pool = create_pool(&config.database).await?;
    ensure_schema(&pool).await?;
    let store = Arc::new(PgCallDocumentRepository::new(pool));

    info!("Connecting to queue...");
    let transport = Arc::new(RedisQueueTransport::new(&config.queue).await?);

    let engine = Arc::new(ReconciliationEngine::new(store.clone(), &config.pipeline));
    let stats = Arc::new(PipelineStats::new());

    info!(
        max_attempts = config.pipeline.max_attempts,
        concurrency = config.pipeline.concurrency,
        stop_lookup_delay_ms = config.pipeline.stop_lookup_delay_ms,
        "Pipeline configured"
    );

    // One consumer per live queue
    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    for stage in QueueStage::LIVE {
        let consumer = EventConsumer::new(
            stage,
            engine.clone(),
            transport.clone(),
            stats.clone(),
            config.pipeline.concurrency,
        );
        let token = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = consumer.run(token).await {
                error!("Consumer for {} queue failed: {}", stage, e);
            }
        });
    }
    tracker.close();

    let bind_addr = config.server_addr();
    info!("Starting HTTP server on {}", bind_addr);

    let state = web::Data::new(AppState {
        store,
        transport,
        stats,
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(configure_routes)
    })
    .workers(2)
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    server_handle.stop(true).await;
    shutdown.cancel();
    tracker.wait().await;

    if let Err(e) = server_task.await? {
        error!("HTTP server error: {}", e);
    }

    info!("cdrflow stopped");
    Ok(())
}
