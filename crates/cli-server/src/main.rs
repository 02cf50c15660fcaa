use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tubegrab::{
    ratelimit::RateLimiter, DownloadService, JobRegistry, ServerConfig, YtDlp, YtDlpSearch,
};

mod routes;

/// Video download server backed by yt-dlp
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory for downloaded files (overrides the config file)
    #[arg(short, long)]
    downloads_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = ServerConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        cfg.bind_addr = bind;
    }
    if let Some(dir) = args.downloads_dir {
        cfg.downloads_dir = dir;
    }

    std::fs::create_dir_all(&cfg.downloads_dir).with_context(|| {
        format!("Failed to create downloads directory: {}", cfg.downloads_dir.display())
    })?;
    let downloads_dir = std::fs::canonicalize(&cfg.downloads_dir).with_context(|| {
        format!("Failed to resolve downloads directory: {}", cfg.downloads_dir.display())
    })?;

    info!("tubegrabd starting");
    info!("Configuration loaded:");
    info!("  Bind address: {}", cfg.bind_addr);
    info!("  Downloads dir: {}", downloads_dir.display());
    info!("  yt-dlp: {}", cfg.ytdlp_bin.display());
    info!("  Max file size: {} MB", cfg.max_file_size_mb);
    info!(
        "  Cleanup: every {}s, max age {}s",
        cfg.cleanup_interval_secs, cfg.max_file_age_secs
    );
    info!(
        "  Rate limit: {} requests per {}s",
        cfg.rate_limit_max_requests, cfg.rate_limit_window_secs
    );

    let ytdlp = Arc::new(YtDlp::from_config(&cfg));
    match ytdlp.version().await {
        Ok(version) => info!("yt-dlp version {}", version),
        Err(e) => warn!("yt-dlp is not usable, downloads will fail: {}", e),
    }

    let registry = JobRegistry::new(ytdlp.clone(), downloads_dir);

    info!("🔄 Sweeping leftovers from a previous run...");
    let report = registry.sweep_once(cfg.max_file_age()).await;
    info!("✅ Startup sweep complete: {} file(s) removed", report.files_removed);
    registry.start_sweeper(cfg.cleanup_interval(), cfg.max_file_age());

    let state = routes::AppState {
        service: DownloadService::new(registry.clone()),
        search: Arc::new(YtDlpSearch::new(ytdlp)),
        limiter: Arc::new(RateLimiter::new(
            cfg.rate_limit_window(),
            cfg.rate_limit_max_requests,
        )),
    };

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.bind_addr))?;
    info!("🚀 Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    registry.shutdown();
    info!("tubegrabd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Shutdown requested");
}
