use food_analysis::{
    config::AppConfig,
    services::{
        analysis,
        connection::{ConnectionError, RedisConnector},
        consumer::Consumer,
        queue::{QueueDefinition, RedisTaskQueue, TaskQueue},
        results::RedisResultStore,
        worker::{Worker, WorkerSettings},
    },
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

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

    tracing::info!("Starting food analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Result cache first: without it no task can finish
    tracing::info!("Connecting to result cache");
    let cache = RedisConnector::new("cache", &config.cache_url(), config.cache_retry())
        .unwrap_or_else(|e| exit_on_connection_failure(e));
    cache
        .acquire()
        .await
        .unwrap_or_else(|e| exit_on_connection_failure(e));

    // Load the analysis backend once; it is owned by this process only
    tracing::info!(backend = %config.analysis_backend, "Initializing analysis backend");
    let backend = analysis::from_config(&config).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to initialize analysis backend, exiting");
        std::process::exit(1)
    });

    tracing::info!("Connecting to task broker");
    let broker = RedisConnector::new("broker", &config.broker_url(), config.broker_retry())
        .unwrap_or_else(|e| exit_on_connection_failure(e));
    broker
        .acquire()
        .await
        .unwrap_or_else(|e| exit_on_connection_failure(e));

    let queue: Arc<dyn TaskQueue> =
        Arc::new(RedisTaskQueue::from_config(Arc::new(broker), &config));
    let subscriptions = config.subscribed_queues();
    for name in &subscriptions {
        queue
            .declare(&QueueDefinition::durable(name))
            .await
            .expect("Failed to declare queue");
    }

    let results = Arc::new(RedisResultStore::new(Arc::new(cache)));
    let worker = Worker::new(backend, results, WorkerSettings::from(&config));
    let consumer = Consumer::new(queue, subscriptions, config.poll_interval());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current delivery");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(backend = %worker.backend_name(), "Worker ready, waiting for tasks");
    consumer.run(&worker, shutdown_rx).await;
    tracing::info!("Worker stopped");
}
