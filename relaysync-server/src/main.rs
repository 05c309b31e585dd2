//! Binary entry point: parse CLI args, init tracing, load config,
//! bootstrap the Supervisor, wire the router, serve, shut down gracefully
//! on signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relaysync_core::{Supervisor, SupervisorConfig};
use relaysync_server::config::Config;
use relaysync_server::state::AppState;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "relaysync", about = "Bidirectional user-state replication across media library nodes")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "RELAYSYNC_CONFIG", default_value = "./relaysync.toml")]
    config: PathBuf,

    /// Run pending database migrations and exit without starting the server.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .with(fmt::layer())
        .init();

    if args.migrate_only {
        // Opening the store alone is enough to run `sqlx::migrate!` and exit
        // — no nodes need to be reachable.
        relaysync_core::SqliteStore::open(&config.database.path).await?;
        info!("migrations applied, exiting");
        return Ok(());
    }

    let supervisor_config = SupervisorConfig {
        database_path: config.database.path.clone(),
        nodes: config.node_configs()?,
        path_sync_policy: config.path_sync_policies(),
        worker: relaysync_core::worker::WorkerConfig {
            max_retries: config.sync.max_retries,
            batch_limit: 20,
            tick_interval: Duration::from_secs(config.sync.worker_interval_seconds),
            cooldown_window: Duration::from_secs(config.sync.progress_debounce_seconds),
        },
        debounce_window: chrono::Duration::seconds(config.sync.progress_debounce_seconds as i64),
    };

    let supervisor = Arc::new(Supervisor::bootstrap(supervisor_config).await?);
    let state = AppState {
        supervisor: supervisor.clone(),
        config: Arc::new(config.clone()),
    };

    let app = relaysync_server::create_app(state);
    let addr = std::net::SocketAddr::new(config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "relaysync listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match Arc::try_unwrap(supervisor) {
        Ok(supervisor) => supervisor.shutdown().await,
        Err(_) => tracing::warn!("supervisor still had live references at shutdown"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining worker");
}
