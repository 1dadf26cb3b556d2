use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::info;

use hivelimit::app::App;
use hivelimit::config::HivelimitConfig;
use hivelimit::telemetry::init_tracing;

/// Rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "hivelimit", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "HIVELIMIT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<std::net::SocketAddr>,

    /// Override the log level (ignored when RUST_LOG is set)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = HivelimitConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;

    info!("Starting Hivelimit Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let app = App::build(config).await?;
    app.run(shutdown_signal()).await?;

    info!("Hivelimit Rate Limiting Service stopped");
    Ok(())
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
