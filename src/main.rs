use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use roost::cache::MemoryRoutingCache;
use roost::config::Config;
use roost::metrics::MemoryMetricsSink;
use roost::orchestrator::{ApiState, RegistryApi};
use roost::registry::monitor::{StaleWorkerMonitor, spawn_monitor};
use roost::registry::{HeartbeatReconciler, SessionRegistrar};
use roost::store::PgRegistryStore;

#[derive(Parser, Debug)]
#[command(name = "roost", about = "Session fleet coordinator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the registry backend: worker API plus the stale worker monitor
    Serve {
        /// Bind host (overrides ROOST_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides ROOST_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a single stale-worker sweep and exit
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Sweep => sweep(config).await,
    }
}

async fn serve(config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let store = Arc::new(PgRegistryStore::new(&config.database).await?);
    store.run_migrations().await?;

    let cache = Arc::new(MemoryRoutingCache::new());
    let metrics = Arc::new(MemoryMetricsSink::default());

    let state = ApiState {
        registrar: Arc::new(SessionRegistrar::new(store.clone(), cache.clone())),
        reconciler: Arc::new(HeartbeatReconciler::new(
            store.clone(),
            cache.clone(),
            metrics,
        )),
    };

    let monitor = spawn_monitor(store, cache, config.monitor.clone());

    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);
    let result = RegistryApi::start(state, &host, port).await;

    monitor.abort();
    result.map_err(|e| anyhow::anyhow!("API server failed: {e}"))
}

async fn sweep(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(PgRegistryStore::new(&config.database).await?);
    let cache = Arc::new(MemoryRoutingCache::new());

    let monitor = StaleWorkerMonitor::new(store, cache, config.monitor);
    let outcome = monitor.sweep().await?;

    println!(
        "Sweep complete: {} worker(s) demoted, {} session(s) released",
        outcome.workers_demoted, outcome.sessions_released
    );
    Ok(())
}
