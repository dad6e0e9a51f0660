use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use food_analysis::app_state::AppState;
use food_analysis::config::AppConfig;
use food_analysis::routes;
use food_analysis::services::{
    connection::{ConnectionError, RedisConnector},
    gateway::Submitter,
    queue::{RedisTaskQueue, TaskQueue},
    results::RedisResultStore,
};

fn exit_on_connection_failure(e: ConnectionError) -> ! {
    if e.is_exhausted() {
        tracing::error!(error = %e, "Infrastructure unreachable at startup, exiting");
    } else {
        tracing::error!(error = %e, "Invalid connection settings, exiting");
    }
    std::process::exit(1)
}

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

    tracing::info!("Initializing food analysis gateway");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "analysis_tasks_submitted_total",
        "Total analysis tasks accepted by the gateway"
    );
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Pending tasks across the analysis queues"
    );

    // Broker and cache are connected independently
    tracing::info!("Connecting to task broker");
    let broker = RedisConnector::new("broker", &config.broker_url(), config.broker_retry())
        .unwrap_or_else(|e| exit_on_connection_failure(e));
    broker
        .acquire()
        .await
        .unwrap_or_else(|e| exit_on_connection_failure(e));

    tracing::info!("Connecting to result cache");
    let cache = RedisConnector::new("cache", &config.cache_url(), config.cache_retry())
        .unwrap_or_else(|e| exit_on_connection_failure(e));
    cache
        .acquire()
        .await
        .unwrap_or_else(|e| exit_on_connection_failure(e));

    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::from_config(Arc::new(broker), &config));
    let results = Arc::new(RedisResultStore::new(Arc::new(cache)));

    let submitter = Submitter::from_config(queue.clone(), &config);
    if let Err(e) = submitter.declare_queues().await {
        // Retried on the first submission
        tracing::warn!(error = %e, "Could not declare queues at startup");
    }

    let state = AppState::new(submitter, queue, results, config.subscribed_queues());

    // Build API routes
    let app = Router::new()
        .route("/api/health", get(routes::health::health_check))
        .route("/api/analyze-food", post(routes::analyze::submit_analysis))
        .route("/api/results/{task_id}", get(routes::analyze::get_result))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    tracing::info!("Starting food analysis gateway on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
