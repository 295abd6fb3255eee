use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use tetris_match::{run_match, MatchConfig};
use tetris_types::Role;

/// Authoritative server for one two-player match.
#[derive(Parser, Debug)]
#[command(name = "tetris-match")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port (allocated by the launcher)
    #[arg(long)]
    port: u16,

    /// Match id recorded in the final log
    #[arg(long)]
    match_id: String,

    /// Room this match belongs to
    #[arg(long)]
    room_id: u64,

    /// Shared bag seed
    #[arg(long)]
    seed: u64,

    /// Authorized player as `user_id:role`; exactly one P1 and one P2
    #[arg(long = "player", required = true)]
    players: Vec<PlayerSpec>,

    /// Session-service address for the result report
    #[arg(long)]
    session_addr: Option<String>,

    /// Gravity interval in milliseconds
    #[arg(long, default_value_t = 500)]
    drop_ms: u64,

    /// Hard cap on match duration, in minutes
    #[arg(long, default_value_t = 30)]
    max_minutes: u64,
}

#[derive(Debug, Clone)]
struct PlayerSpec {
    user_id: u64,
    role: Role,
}

impl FromStr for PlayerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_id, role) = s
            .split_once(':')
            .ok_or_else(|| format!("expected user_id:role, got '{s}'"))?;
        Ok(Self {
            user_id: user_id
                .parse()
                .map_err(|e| format!("bad user id '{user_id}': {e}"))?,
            role: role.parse()?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let p1 = args
        .players
        .iter()
        .find(|p| p.role == Role::P1)
        .ok_or_else(|| anyhow::anyhow!("a --player with role P1 is required"))?;
    let p2 = args
        .players
        .iter()
        .find(|p| p.role == Role::P2)
        .ok_or_else(|| anyhow::anyhow!("a --player with role P2 is required"))?;
    if args.players.len() != 2 || p1.user_id == p2.user_id {
        anyhow::bail!("exactly two distinct players are required");
    }

    let mut cfg = MatchConfig::new(
        args.match_id,
        args.room_id,
        args.seed,
        [(p1.user_id, Role::P1), (p2.user_id, Role::P2)],
    );
    cfg.drop_ms = args.drop_ms;
    cfg.max_duration = Duration::from_secs(args.max_minutes * 60);
    cfg.session_addr = args.session_addr;

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("match server listening on {}:{}", args.host, args.port);

    let outcome = run_match(listener, cfg).await?;
    info!(winner = ?outcome.winner, "exiting");
    Ok(())
}
