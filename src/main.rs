use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LogFormat, LoggingConfig, WardenConfig};
use ratewarden::http::HttpServer;
use ratewarden::ratelimit::{PolicyRegistry, RateLimiter};
use ratewarden::store::RedisCounterStore;

/// Fixed-window admission control backed by a shared counter store.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overriding the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Counter store URL, overriding the configuration
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = WardenConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.listen {
        config.server.http_addr = addr;
    }
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }

    init_tracing(&config.logging);

    let instance_id = uuid::Uuid::new_v4();
    info!("Starting Ratewarden admission control");
    info!(version = env!("CARGO_PKG_VERSION"), instance_id = %instance_id, "Build info");
    info!(http_addr = %config.server.http_addr, store_url = %config.store.url, "Configuration loaded");

    // Invalid policies abort startup here rather than failing per request.
    let registry = PolicyRegistry::from_overrides(&config.policies)?;
    let policies: Vec<String> = registry.names().into_iter().map(str::to_string).collect();

    let store = Arc::new(RedisCounterStore::connect(&config.store).await?);
    let rate_limiter = Arc::new(RateLimiter::with_config(store, registry, &config.store));
    info!(fail_mode = ?config.admission.fail_mode, "Rate limiter initialized");

    let http_server = HttpServer::new(
        config.server.http_addr,
        rate_limiter,
        config.admission.clone(),
        policies,
    );

    http_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratewarden stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
