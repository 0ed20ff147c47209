#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vidfetch::{
    api::{self, AppState},
    config::{self, DEFAULT_CONFIG_PATH},
    jobs::JobRegistry,
    security,
    worker::{self, WorkerContext},
    ytdlp::YtDlp,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Download videos through yt-dlp over HTTP.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the env-style config file"
    )]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Override the listen address")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
    #[arg(
        long = "download-dir",
        value_name = "PATH",
        help = "Override where finished downloads are staged"
    )]
    download_dir: Option<PathBuf>,
    #[arg(long = "allow-root", help = "Permit running as root (containers only)")]
    allow_root: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vidfetch=info,backend=info,tower_http=info")),
        )
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    security::ensure_not_root("backend", cli.allow_root)?;

    let mut runtime = config::load_runtime_config_from(&cli.config)?;
    if let Some(host) = cli.host {
        runtime.host = host;
    }
    if let Some(port) = cli.port {
        runtime.port = port;
    }
    if let Some(dir) = cli.download_dir {
        runtime.download_dir = dir;
    }

    let ytdlp = YtDlp::new(&runtime.ytdlp_path, runtime.user_agent.clone());
    let version = ytdlp.ensure_available().await?;
    info!(%version, program = %runtime.ytdlp_path.display(), "found yt-dlp");

    tokio::fs::create_dir_all(&runtime.download_dir)
        .await
        .with_context(|| format!("creating {}", runtime.download_dir.display()))?;

    let tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();
    let state = AppState {
        worker: WorkerContext {
            registry: Arc::new(JobRegistry::new()),
            fetcher: Arc::new(ytdlp),
            download_dir: runtime.download_dir.clone(),
            download_timeout: runtime.download_timeout,
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
        },
        cleanup_delay: runtime.cleanup_delay,
    };

    worker::spawn_sweeper(state.worker.clone(), runtime.job_retention);

    let cors = api::build_cors_layer(&runtime.allowed_origins)?;
    let app = api::router(state, cors);

    let addr = SocketAddr::new(
        runtime
            .host
            .parse()
            .with_context(|| format!("parsing listen address {}", runtime.host))?,
        runtime.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        download_dir = %runtime.download_dir.display(),
        "API server listening on http://{}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!(pending = tracker.len(), "stopping background jobs");
    shutdown.cancel();
    tracker.close();
    tracker.wait().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}
