use clap::Parser;
use signalbox::alert::dispatch::AlertDispatcher;
use signalbox::alert::evaluator::AlertEvaluator;
use signalbox::alert::store::SqliteAlertStore;
use signalbox::config::AppConfig;
use signalbox::ingest::handler::IngestState;
use signalbox::query::cache::SignalCache;
use signalbox::query::handler::QueryState;
use signalbox::routes::{build_router, AlertState};
use signalbox::{pipeline, storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "signalbox", about = "Behavioral signal engine for web analytics")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalbox=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        db = %config.database.path.display(),
        "starting signalbox"
    );

    // Setup SQLite pool
    let pool = storage::sqlite::create_pool(&config.database)?;
    storage::sqlite::init_pool(&pool).await?;
    tracing::info!("database initialized");

    // Setup MPSC channel
    let (tx, rx) = mpsc::channel(config.ingest.channel_capacity);

    // Spawn pipeline worker
    let worker_pool = pool.clone();
    let pipeline_config = config.pipeline.clone();
    let worker_handle = tokio::spawn(async move {
        pipeline::worker::run_worker(rx, worker_pool, pipeline_config).await;
    });

    // Spawn retention background task
    let retention_pool = pool.clone();
    let retention_days = config.retention.raw_events_days;
    let retention_interval = config.retention.prune_interval_secs;
    tokio::spawn(async move {
        storage::retention::retention_loop(retention_pool, retention_days, retention_interval)
            .await;
    });

    // Alert dispatcher and evaluator
    let dispatcher = Arc::new(AlertDispatcher::new(Duration::from_secs(
        config.alerting.dispatch_timeout_secs,
    ))?);
    let alert_store = Arc::new(SqliteAlertStore::new(pool.clone()));
    let evaluator = Arc::new(AlertEvaluator::new(
        alert_store,
        dispatcher.clone(),
        &config.alerting,
    ));
    let evaluator_handle = evaluator.start();

    let ingest_state = Arc::new(IngestState {
        config: config.ingest.clone(),
        tx: tx.clone(),
    });
    let query_state = Arc::new(QueryState {
        pool: pool.clone(),
        cache: SignalCache::new(config.cache.ttl_secs),
        detection: config.detection.clone(),
        channel_capacity: config.ingest.channel_capacity,
        channel_tx: tx.clone(),
    });
    let alert_state = Arc::new(AlertState {
        pool: pool.clone(),
        dispatcher,
    });
    // Handlers hold their own senders; this one is no longer needed
    drop(tx);

    let app = build_router(
        ingest_state,
        query_state,
        alert_state,
        config.ingest.max_payload_bytes,
        config.server.cors_origin.as_deref(),
    )?;

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down...");
    evaluator_handle.stop().await;

    // The router (and every sender it held) is gone, so the worker drains and exits
    if tokio::time::timeout(Duration::from_secs(10), worker_handle)
        .await
        .is_err()
    {
        tracing::warn!("pipeline worker did not drain within 10s");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
