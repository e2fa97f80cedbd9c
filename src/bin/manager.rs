//! Clustersynchro manager
//!
//! Run with: clustersynchro-manager --definitions clusters.toml

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clustersynchro::cluster::HttpConnector;
use clustersynchro::config::{Config, RemovalPolicy};
use clustersynchro::discovery::FileDefinitionSource;
use clustersynchro::manager::{AlwaysLeader, SynchroManager};
use clustersynchro::storage::{init_storage_factory, shutdown_storage_factory};

#[derive(Parser, Debug)]
#[command(name = "clustersynchro-manager")]
#[command(about = "Synchronize resources from member clusters into one store")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "CLUSTERSYNCHRO_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster definitions file (TOML or JSON)
    #[arg(long, env = "CLUSTERSYNCHRO_DEFINITIONS")]
    definitions: PathBuf,

    /// How often the definitions file is re-read, in seconds
    #[arg(long, env = "CLUSTERSYNCHRO_POLL_INTERVAL", default_value = "10")]
    poll_interval_secs: u64,

    /// Storage backend (memory, sqlite)
    #[arg(long, env = "CLUSTERSYNCHRO_STORAGE_BACKEND")]
    storage_backend: Option<String>,

    /// Database path for file-backed storage
    #[arg(long, env = "CLUSTERSYNCHRO_DB_PATH")]
    db_path: Option<String>,

    /// Maximum concurrently running synchros
    #[arg(long, env = "CLUSTERSYNCHRO_MAX_CONCURRENT")]
    max_concurrent_synchros: Option<usize>,

    /// What to do with records of removed clusters (retain, purge)
    #[arg(long, env = "CLUSTERSYNCHRO_REMOVAL_POLICY")]
    removal_policy: Option<RemovalPolicy>,

    /// Periodic relist interval in seconds (0 = disabled)
    #[arg(long, env = "CLUSTERSYNCHRO_RESYNC_INTERVAL")]
    resync_interval_secs: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CLUSTERSYNCHRO_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(backend) = &self.storage_backend {
            config.storage.backend = backend.clone();
        }
        if let Some(db_path) = &self.db_path {
            config.storage.db_path = db_path.clone();
        }
        if let Some(max) = self.max_concurrent_synchros {
            config.synchro.max_concurrent_synchros = max;
        }
        if let Some(policy) = self.removal_policy {
            config.synchro.removal_policy = policy;
        }
        if let Some(secs) = self.resync_interval_secs {
            config.synchro.resync_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = args.load_config()?;
    tracing::info!(
        version = clustersynchro::VERSION,
        backend = %config.storage.backend,
        max_concurrent = config.synchro.max_concurrent_synchros,
        "Starting clustersynchro manager"
    );

    let factory = init_storage_factory(&config.storage).context("opening storage")?;
    let manager = Arc::new(SynchroManager::new(
        factory.resource_storage(),
        Arc::new(HttpConnector::new(config.synchro.request_timeout())),
        config.synchro.clone(),
        Arc::new(AlwaysLeader::new()),
    ));

    let (events_tx, events_rx) = mpsc::channel(256);
    let control = manager.spawn(events_rx);

    let cancel = CancellationToken::new();
    let source = FileDefinitionSource::new(
        &args.definitions,
        Duration::from_secs(args.poll_interval_secs.max(1)),
    );
    let discovery = tokio::spawn(source.run(events_tx, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");

    cancel.cancel();
    let _ = discovery.await;
    manager.shutdown().await;
    let _ = control.await;
    shutdown_storage_factory().await?;

    tracing::info!("Clustersynchro manager stopped");
    Ok(())
}
