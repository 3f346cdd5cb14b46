//! Engram daemon
//!
//! Long-running HTTP process around the memory engine: opens the store,
//! picks mock or live embeddings, starts the decay scheduler, and serves the
//! operation surface as JSON routes until interrupted.

mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use engram_core::{
    DaemonDefaults, DecayScheduler, EmbeddingClient, MemoryService, MemoryStore, SchedulerConfig,
    SemanticLevel,
};

#[derive(Debug, Parser)]
#[command(name = "engram-daemon", version, about = "Agent memory service")]
struct Args {
    /// SQLite database path (platform data dir when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Bind address for the HTTP listener
    #[arg(long, default_value = "127.0.0.1:8756")]
    bind: SocketAddr,

    /// Force mock embeddings regardless of provider env vars
    #[arg(long)]
    mock: bool,

    /// Hours between decay passes after the first run
    #[arg(long, default_value_t = 24)]
    decay_interval_hours: u64,

    /// Align the first decay run to this UTC time of day (HH:MM)
    #[arg(long)]
    decay_time: Option<String>,

    /// Disable the decay scheduler entirely
    #[arg(long)]
    no_decay: bool,

    /// Default semantic level when no settings document applies
    #[arg(long, default_value = "off")]
    semantic_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let store = Arc::new(MemoryStore::new(args.db.clone()).context("opening store")?);
    let embedder = Arc::new(if args.mock {
        EmbeddingClient::mock()
    } else {
        EmbeddingClient::from_env()
    });
    tracing::info!(
        mock = embedder.is_mock(),
        model = embedder.model(),
        "Embedding client ready"
    );

    let defaults = DaemonDefaults {
        semantic_level: SemanticLevel::parse_name(&args.semantic_level)
            .context("invalid --semantic-level")?,
        ..Default::default()
    };
    let service =
        Arc::new(MemoryService::new(store, embedder, defaults).context("wiring service")?);

    let decay_time = args
        .decay_time
        .as_deref()
        .map(|s| SchedulerConfig::parse_time_of_day(s).context("invalid --decay-time (HH:MM)"))
        .transpose()?;
    let scheduler = Arc::new(DecayScheduler::new(
        service.lifecycle(),
        SchedulerConfig {
            decay_enabled: !args.no_decay,
            decay_interval_hours: args.decay_interval_hours,
            decay_time_of_day: decay_time,
        },
    ));
    scheduler.start().context("starting decay scheduler")?;

    let app = routes::router(service);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(addr = %args.bind, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    scheduler.stop();
    tracing::info!("Shut down cleanly");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for shutdown signal: {}", e);
    }
}
