use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bulwark::audit::TracingAuditSink;
use bulwark::context::StaticIdentityProvider;
use bulwark::server::HttpServer;
use bulwark::{Bulwark, BulwarkConfig};

/// Adaptive rate limiting and anti-abuse admission control.
#[derive(Parser, Debug)]
#[command(name = "bulwark", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "BULWARK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Bulwark admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = BulwarkConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    let addr = config.server.listen_addr;
    info!(listen_addr = %addr, fail_mode = ?config.fail_mode, "Configuration loaded");

    let identity = Arc::new(StaticIdentityProvider::new(&config.identity.tokens));
    let bulwark = Arc::new(Bulwark::new(config, Arc::new(TracingAuditSink), identity)?);
    bulwark.start();

    let server = HttpServer::new(addr, bulwark.clone());
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    bulwark.shutdown().await;
    served?;

    info!("Bulwark stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
