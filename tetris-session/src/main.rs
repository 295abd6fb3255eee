use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use tetris_persistence::PersistClient;
use tetris_session::{
    connection, LauncherConfig, MatchLauncher, Registry, SessionShared,
};

/// Session service: authentication, rooms, and match coordination.
#[derive(Parser, Debug)]
#[command(name = "tetris-session")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(long, default_value_t = 10002)]
    port: u16,

    /// Host name advertised to clients for match-server endpoints
    #[arg(long, default_value = "localhost")]
    advertise_host: String,

    /// Address of the persistence service
    #[arg(long, default_value = "localhost:10001")]
    persist_addr: String,

    /// First port of the match-server pool
    #[arg(long, default_value_t = 10100)]
    match_port_base: u16,

    /// Number of ports in the match-server pool
    #[arg(long, default_value_t = 100)]
    match_port_span: u16,

    /// Path to the tetris-match executable; defaults to a sibling of this one
    #[arg(long)]
    match_bin: Option<PathBuf>,

    /// Hard cap on match duration, in minutes
    #[arg(long, default_value_t = 30)]
    match_max_minutes: u64,
}

fn default_match_bin() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("executable has no parent directory"))?;
    Ok(dir.join("tetris-match"))
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

    let persist = PersistClient::new(args.persist_addr.clone());
    if let Err(e) = persist.connect().await {
        error!("cannot start without the persistence service: {e}");
        std::process::exit(1);
    }

    let match_bin = match args.match_bin.clone() {
        Some(path) => path,
        None => default_match_bin()?,
    };
    let launcher = MatchLauncher::new(LauncherConfig {
        match_bin,
        port_base: args.match_port_base,
        port_span: args.match_port_span,
        session_addr: format!("{}:{}", args.advertise_host, args.port),
        max_match_duration: Duration::from_secs(args.match_max_minutes * 60),
    });

    let shared = Arc::new(SessionShared::new(
        Registry::new(),
        persist,
        launcher,
        args.advertise_host.clone(),
    ));

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("session service listening on {}:{}", args.host, args.port);

    tokio::select! {
        _ = connection::serve(listener, shared.clone()) => {}
        _ = shutdown_signal() => {}
    }

    shared.launcher.shutdown_all().await;
    info!("session service stopped");
    Ok(())
}
