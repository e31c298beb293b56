use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cortex_agents::tools::loader;
use cortex_agents::{Brain, DynamicToolbox, Toolbox};
use cortex_db::SqliteThreadStore;
use cortex_gateway::{build_router, AppState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Server for orchestrating LLM providers and tools.
#[derive(Debug, Parser)]
#[command(name = "cortex-server", version, about)]
struct Args {
    /// Enable debug logging.
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// SQLite database path for thread history.
    #[arg(long, env = "DB_PATH", default_value = "cortex.db")]
    db_path: PathBuf,

    /// LLM request timeout in seconds.
    #[arg(long, env = "TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Refresh interval for tool sources in seconds.
    #[arg(long, env = "REFRESH", default_value_t = 30)]
    refresh: u64,

    /// Brain definition file.
    #[arg(long, env = "CONFIG", default_value = "brain.yaml")]
    config: PathBuf,

    /// Tool definition file (multi-document YAML).
    #[arg(long, env = "TOOLS")]
    tools: Option<PathBuf>,

    /// Bind address.
    #[arg(long, env = "BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Maximum request payload size in bytes.
    #[arg(long, env = "MAX_BODY_SIZE", default_value_t = 1048576)]
    max_body_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let store = Arc::new(
        SqliteThreadStore::open(&args.db_path).context("open thread store")?,
    );

    let mut toolbox = DynamicToolbox::new();
    if let Some(tools) = &args.tools {
        for source in loader::load_file(tools).context("load tool file")? {
            toolbox.source(source);
        }
    }
    let toolbox = Arc::new(toolbox);

    info!("loading initial tools state");
    toolbox.update(true).await.context("load tools")?;

    info!("loading brain config");
    let brain = Brain::from_file(
        &args.config,
        toolbox.clone() as Arc<dyn Toolbox>,
        Some(store.clone()),
    )
    .await
    .context("load brain config")?;
    info!("configuration loaded");

    // refresh tool sources in the background; failures keep the last good set
    let refresh_toolbox = toolbox.clone();
    let refresh_every = Duration::from_secs(args.refresh.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_every);
        ticker.tick().await; // immediate first tick, already loaded
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_toolbox.update(false).await {
                warn!(error = %e, "failed to update tool sources");
            }
        }
    });

    let state = AppState {
        brain: Arc::new(brain),
        timeout: Duration::from_secs(args.timeout),
        max_body: args.max_body_size,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install shutdown signal handler");
    }
}
