//! quorumd - per-client anomaly detection daemon
//!
//! Usage:
//!   quorumd --listen 0.0.0.0:8000
//!   quorumd --config quorum.json --history anomalies.jsonl --workers 8

use clap::Parser;
use quorum_core::config::EngineConfig;
use quorum_core::persistence::{HistoryStore, JsonlStore, MemoryStore, PersistenceWriter};
use quorum_core::pipeline::Engine;
use quorum_core::transport::{AppState, router};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quorumd")]
#[command(about = "Real-time per-client anomaly detection over WebSocket")]
struct Cli {
    /// JSON engine configuration; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: String,

    /// Per-session queue bound before the oldest point is dropped
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Detector worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Append results to this JSON lines file instead of keeping them in memory
    #[arg(long)]
    history: Option<PathBuf>,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(workers) = self.workers {
            config.worker_threads = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config()?;

    let store: Arc<dyn HistoryStore> = match &cli.history {
        Some(path) => {
            info!(path = %path.display(), "Persisting results to JSON lines.");
            Arc::new(JsonlStore::open(path)?)
        }
        None => {
            info!("Persisting results in memory.");
            Arc::new(MemoryStore::new())
        }
    };
    let (persistence, writer) = PersistenceWriter::spawn(
        Arc::clone(&store),
        config.persistence_capacity,
        config.persistence_timeout(),
    )?;

    info!(
        workers = config.worker_threads,
        queue_capacity = config.queue_capacity,
        detectors = config.ensemble.detectors.len(),
        "Starting detection engine."
    );
    let engine = Arc::new(Engine::with_persistence(config, persistence)?);

    let app = router(AppState {
        engine: Arc::clone(&engine),
        store,
    });

    let listener = TcpListener::bind(&cli.listen).await?;
    info!(addr = %cli.listen, "quorumd listening.");
    info!("Endpoints:");
    info!("  GET /ws                   - WebSocket ingestion");
    info!("  GET /sessions             - Active sessions");
    info!("  GET /sessions/{{id}}        - Session snapshot");
    info!("  GET /history/{{id}}         - Persisted results");
    info!("  GET /metrics              - Prometheus metrics");
    info!("  GET /health               - Health check");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            info!("Shutting down... (Draining detector workers)");
        })
        .await?;

    engine.shutdown();
    info!("Detector workers stopped.");

    writer.shutdown();
    info!("Persistence flushed. Goodbye.");
    Ok(())
}
