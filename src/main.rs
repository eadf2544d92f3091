use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::http::HttpServer;
use turnstile::ratelimit::PolicyRegistry;

/// Fixed-window rate limiting admission service
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the configuration file
    #[arg(short, long, env = "TURNSTILE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Log filter directive, overrides the configuration file
    #[arg(long, env = "TURNSTILE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format, overrides the configuration file
    #[arg(long, env = "TURNSTILE_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        policies = config.policies.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(PolicyRegistry::from_policies(&config.policies)?);
    let sweepers = registry.spawn_sweepers();

    let server = HttpServer::new(config.server.listen_addr, registry);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    for sweeper in sweepers {
        sweeper.shutdown().await;
    }
    served?;

    info!("Turnstile admission service stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
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
