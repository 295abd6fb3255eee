use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use tetris_persistence::{service, Storage};

/// Persistence service: users, rooms, and match logs over framed JSON.
#[derive(Parser, Debug)]
#[command(name = "tetris-persistence")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = 10001)]
    port: u16,

    /// Directory for the JSON data files; memory-only when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
        info!("received Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let storage = match &args.data_dir {
        Some(dir) => Storage::open(dir)?,
        None => {
            info!("no --data-dir given, running memory-only");
            Storage::in_memory()
        }
    };

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("persistence service listening on {}:{}", args.host, args.port);

    tokio::select! {
        _ = service::run(listener, Arc::new(storage)) => {}
        _ = shutdown_signal() => {}
    }

    info!("persistence service stopped");
    Ok(())
}
