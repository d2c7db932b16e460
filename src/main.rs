//! dirstore -- S3-compatible server for a local directory tree.
//!
//! SIGTERM/SIGINT stop accepting connections and let in-flight requests
//! finish. Writes go through temp-file-and-rename, so there is nothing to
//! clean up on exit.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use dirstore::config::{Config, LoggingConfig, Overrides};
use dirstore::storage::backend::StorageBackend;
use dirstore::storage::local::LocalBackend;

/// Command-line arguments for the dirstore server.
#[derive(Parser, Debug)]
#[command(
    name = "dirstore",
    version,
    about = "S3-compatible server for a local directory tree"
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address (host:port or :port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the access key.
    #[arg(long)]
    access_key: Option<String>,

    /// Override the secret key.
    #[arg(long)]
    secret_key: Option<String>,

    /// Override the directory exposed as buckets.
    #[arg(short, long)]
    mount: Option<PathBuf>,

    /// Override the name of the internal metadata directory.
    #[arg(long = "metadata")]
    metadata_dir: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => dirstore::config::load_config(path)?,
        None => Config::default(),
    };
    config.apply_overrides(Overrides {
        bind: cli.bind,
        access_key: cli.access_key,
        secret_key: cli.secret_key,
        mount: cli.mount,
        metadata_dir: cli.metadata_dir,
    })?;

    init_tracing(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path.display());
    }

    if config.observability.metrics {
        dirstore::metrics::init_metrics(config.observability.metrics_addr)?;
        match config.observability.metrics_addr {
            Some(addr) => info!("Prometheus exporter listening on {}", addr),
            None => info!("Prometheus metrics recorder installed"),
        }
    }

    let backend = LocalBackend::new(&config.storage.mount, &config.storage.metadata_dir)?;
    info!(
        "Serving {} (metadata in {})",
        backend.root().display(),
        config.storage.metadata_dir
    );
    let storage: Arc<dyn StorageBackend> = Arc::new(backend);

    let bind_addr = config.server.bind_addr();
    let state = Arc::new(dirstore::AppState { config, storage });
    let app = dirstore::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("dirstore listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("dirstore shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
