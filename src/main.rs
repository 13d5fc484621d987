use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_store::{
    api,
    config::Config,
    object_store::{self as obj, Backends},
    storage::{models::BackendKind, Database},
    AppState,
};

/// How long shutdown waits for in-flight transfers before abandoning them.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-store starting");

    let config = Config::load()?;
    info!(node_id = %config.node.id, "Loaded configuration");

    let db = Database::open(&config.node.data_dir)?;
    info!(path = %config.node.data_dir, "Database opened");

    let backends = build_backends(&config).await?;
    match config.tiering.target {
        Some(target) => info!(
            target = %target,
            mode = ?config.tiering.mode,
            workers = config.tiering.workers,
            "Tiering enabled"
        ),
        None => info!("Tiering disabled; blobs stay on the local stage"),
    }

    let state = Arc::new(AppState::new(config.clone(), db, backends)?);

    // Pick up transfers lost while the process was down
    match state.tier.reconcile() {
        Ok(count) => info!(enqueued = count, "Startup reconciliation complete"),
        Err(e) => tracing::error!(error = %e, "Startup reconciliation failed"),
    }

    let shutdown = CancellationToken::new();
    let mut workers = state.tier.spawn_workers(shutdown.clone());
    workers.push(
        state
            .tier
            .spawn_reconciler(config.reconcile_interval, shutdown.clone()),
    );

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping transfer workers");
    shutdown.cancel();
    for handle in workers {
        let abort = handle.abort_handle();
        if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, handle).await.is_err() {
            // Unacknowledged work is redelivered after its lease expires.
            tracing::warn!("Transfer worker did not stop in time, aborting");
            abort.abort();
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn build_backends(config: &Config) -> anyhow::Result<Backends> {
    let mut backends = Backends::new();

    for kind in config.enabled_backends() {
        match kind {
            BackendKind::Disk => {
                let store = obj::LocalStore::new(&config.storage.disk_path)
                    .with_context(|| format!("opening disk backend at {}", config.storage.disk_path))?;
                info!(path = %config.storage.disk_path, "Disk backend ready");
                backends.insert(kind, Arc::new(store));
            }
            BackendKind::Gcs => {
                let bucket = config
                    .storage
                    .gcs_bucket
                    .as_deref()
                    .context("GCS_BUCKET is not set")?;
                let store =
                    obj::GcsStore::new(bucket, config.storage.gcs_credentials_file.as_deref())
                        .await?;
                info!(bucket, "GCS backend ready");
                backends.insert(kind, Arc::new(store));
            }
            BackendKind::S3 => {
                let s3 = config.storage.s3.as_ref().context("S3_BUCKET is not set")?;
                let store = obj::S3Store::new(&s3.bucket, &s3.region, s3.endpoint.as_deref()).await;
                info!(bucket = %s3.bucket, region = %s3.region, "S3 backend ready");
                backends.insert(kind, Arc::new(store));
            }
        }
    }

    Ok(backends)
}

async fn shutdown_signal() {
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

    info!("Shutdown signal received, draining connections");
}
