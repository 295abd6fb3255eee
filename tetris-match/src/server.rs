//! One authoritative match.
//!
//! The server accepts exactly two players, validates their HELLO against the
//! authorized (room, user) pairs, then runs a 10 Hz tick loop that is the
//! sole mutator of both engines: queued inputs apply in arrival order,
//! gravity fires per player once its interval has elapsed since the last
//! gravity-or-lock, and two snapshots go out to both connections every tick.
//! Disconnects forfeit; after a top-out one more tick of snapshots goes out
//! before GAME_OVER.

use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tetris_core::{Board, Engine, StepOutcome};
use tetris_types::framing::{read_frame, read_frame_timeout, write_frame};
use tetris_types::{
    now_iso, now_millis, ActiveState, GravityPlan, InputAction, MatchMessage, PlayerResult,
    Response, Role, ServiceError, SessionRequest, Snapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchPhase {
    AwaitingPlayers,
    Running,
    Terminating,
    Done,
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub match_id: String,
    pub room_id: u64,
    pub seed: u64,
    /// Authorized players, P1 first.
    pub players: [(u64, Role); 2],
    pub drop_ms: u64,
    pub tick_ms: u64,
    pub handshake_timeout: Duration,
    pub max_duration: Duration,
    /// Session-service control channel for the final result report.
    pub session_addr: Option<String>,
    /// Pre-populated board applied to both engines. Test hook.
    pub board_prefill: Option<Board>,
}

impl MatchConfig {
    pub fn new(match_id: String, room_id: u64, seed: u64, players: [(u64, Role); 2]) -> Self {
        Self {
            match_id,
            room_id,
            seed,
            players,
            drop_ms: 500,
            tick_ms: 100,
            handshake_timeout: Duration::from_secs(30),
            max_duration: Duration::from_secs(30 * 60),
            session_addr: None,
            board_prefill: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub winner: Option<u64>,
    pub results: Vec<PlayerResult>,
    pub start_at: String,
    pub end_at: String,
}

enum InputEvent {
    Action { slot: usize, action: InputAction },
    Disconnected { slot: usize },
}

pub async fn run_match(listener: TcpListener, cfg: MatchConfig) -> anyhow::Result<MatchOutcome> {
    let start_at = now_iso();
    let mut phase = MatchPhase::AwaitingPlayers;
    info!(
        match_id = %cfg.match_id,
        room_id = cfg.room_id,
        seed = cfg.seed,
        ?phase,
        "awaiting players"
    );

    let mut streams = accept_players(&listener, &cfg).await;

    let connected: Vec<usize> = (0..2).filter(|&i| streams[i].is_some()).collect();
    if connected.len() < 2 {
        warn!(
            "handshake window elapsed with {} player(s), aborting",
            connected.len()
        );
        let winner = connected.first().map(|&i| cfg.players[i].0);
        let results: Vec<PlayerResult> = cfg
            .players
            .iter()
            .map(|&(user_id, _)| PlayerResult {
                user_id,
                score: 0,
                lines: 0,
                max_combo: 0,
            })
            .collect();
        let game_over = MatchMessage::GameOver {
            winner,
            results: results.clone(),
        };
        for slot in connected {
            if let Some(stream) = streams[slot].as_mut() {
                let _ = write_frame(stream, &game_over).await;
            }
        }
        let end_at = now_iso();
        report_result(&cfg, winner, &results, &start_at, &end_at).await;
        return Ok(MatchOutcome {
            winner,
            results,
            start_at,
            end_at,
        });
    }

    phase = MatchPhase::Running;
    info!(?phase, "both players connected");

    let mut engines: Vec<Engine> = (0..2)
        .map(|_| match cfg.board_prefill {
            Some(board) => Engine::with_board(cfg.seed, board),
            None => Engine::new(cfg.seed),
        })
        .collect();

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    let mut writers = Vec::with_capacity(2);
    for (slot, slot_stream) in streams.iter_mut().enumerate() {
        let stream = slot_stream.take().expect("both players are connected");
        let (read_half, write_half) = stream.into_split();
        writers.push(Some(write_half));
        tokio::spawn(read_inputs(
            read_half,
            slot,
            cfg.players[slot].0,
            input_tx.clone(),
        ));
    }
    drop(input_tx);

    let drop_interval = Duration::from_millis(cfg.drop_ms);
    let mut interval = tokio::time::interval(Duration::from_millis(cfg.tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let hard_stop = Instant::now() + cfg.max_duration;
    // One shared origin so both players' first gravity lands on the same tick.
    let mut last_fall = [Instant::now(); 2];
    let mut tick: u64 = 0;
    let mut winner: Option<u64> = None;
    let mut finish_tick: Option<u64> = None;

    loop {
        interval.tick().await;
        tick += 1;

        // Inputs, in arrival order across both queues.
        while let Ok(event) = input_rx.try_recv() {
            match event {
                InputEvent::Action { slot, action } => {
                    if engines[slot].game_over() {
                        continue;
                    }
                    if let StepOutcome::Locked { .. } = engines[slot].apply(action) {
                        last_fall[slot] = Instant::now();
                    }
                }
                InputEvent::Disconnected { slot } => {
                    if finish_tick.is_none() && !engines[slot].game_over() {
                        info!(
                            user_id = cfg.players[slot].0,
                            "player disconnected, forfeiting"
                        );
                        engines[slot].top_out();
                    }
                }
            }
        }

        // Gravity, per player, once the interval has elapsed since that
        // player's last gravity or lock.
        let now = Instant::now();
        for slot in 0..2 {
            if !engines[slot].game_over() && now.duration_since(last_fall[slot]) >= drop_interval
            {
                engines[slot].gravity();
                last_fall[slot] = now;
            }
        }

        // One snapshot per player, both broadcast to both connections.
        let frames: Vec<MatchMessage> = (0..2)
            .map(|slot| {
                MatchMessage::Snapshot(build_snapshot(&mut engines[slot], tick, cfg.players[slot]))
            })
            .collect();
        for slot in send_to_all(&mut writers, &frames).await {
            if finish_tick.is_none() && !engines[slot].game_over() {
                info!(user_id = cfg.players[slot].0, "send failed, forfeiting");
                engines[slot].top_out();
            }
        }

        if let Some(finished_at) = finish_tick {
            // The extra tick of final snapshots has gone out.
            if tick > finished_at {
                break;
            }
        } else {
            let over: Vec<usize> = (0..2).filter(|&i| engines[i].game_over()).collect();
            if !over.is_empty() {
                winner = match over.len() {
                    2 => None,
                    _ => Some(cfg.players[1 - over[0]].0),
                };
                finish_tick = Some(tick);
                phase = MatchPhase::Terminating;
                info!(tick, ?winner, ?phase, "top-out, one final snapshot tick remains");
            }
        }

        if Instant::now() >= hard_stop {
            warn!(?phase, "match exceeded the duration cap, ending in a draw");
            for engine in &mut engines {
                engine.top_out();
            }
            winner = None;
            phase = MatchPhase::Terminating;
            break;
        }
    }

    info!(?phase, "broadcast finished, reporting result");
    let results: Vec<PlayerResult> = (0..2)
        .map(|slot| PlayerResult {
            user_id: cfg.players[slot].0,
            score: engines[slot].score(),
            lines: engines[slot].lines(),
            max_combo: 0,
        })
        .collect();
    let game_over = MatchMessage::GameOver {
        winner,
        results: results.clone(),
    };
    send_to_all(&mut writers, std::slice::from_ref(&game_over)).await;

    let end_at = now_iso();
    report_result(&cfg, winner, &results, &start_at, &end_at).await;

    phase = MatchPhase::Done;
    info!(?winner, ?phase, "match finished");
    Ok(MatchOutcome {
        winner,
        results,
        start_at,
        end_at,
    })
}

/// Accept connections and run handshakes until both slots are filled or the
/// window (30 s from the first connection) elapses. A rejected handshake
/// gets one error frame and its connection closed; the slot stays open.
async fn accept_players(listener: &TcpListener, cfg: &MatchConfig) -> [Option<TcpStream>; 2] {
    let mut streams: [Option<TcpStream>; 2] = [None, None];
    let mut deadline: Option<Instant> = None;

    while streams.iter().any(|s| s.is_none()) {
        let accepted = match deadline {
            None => match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, listener.accept()).await {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                    Err(_) => break,
                }
            }
        };
        let (mut stream, addr) = accepted;
        let window_end = *deadline.get_or_insert_with(|| Instant::now() + cfg.handshake_timeout);

        let remaining = window_end.saturating_duration_since(Instant::now());
        match handshake(&mut stream, cfg, &streams, remaining).await {
            Ok(slot) => {
                info!(
                    user_id = cfg.players[slot].0,
                    role = %cfg.players[slot].1,
                    "player connected from {addr}"
                );
                streams[slot] = Some(stream);
            }
            Err(e) => {
                warn!("rejected connection from {addr}: {e}");
                let _ = write_frame(&mut stream, &Response::error(&e)).await;
            }
        }
    }
    streams
}

async fn handshake(
    stream: &mut TcpStream,
    cfg: &MatchConfig,
    taken: &[Option<TcpStream>; 2],
    deadline: Duration,
) -> Result<usize, ServiceError> {
    let message: MatchMessage = read_frame_timeout(stream, deadline)
        .await
        .map_err(|e| ServiceError::new(e.kind(), e.to_string()))?;
    let MatchMessage::Hello {
        version,
        room_id,
        user_id,
    } = message
    else {
        return Err(ServiceError::permission_denied("expected HELLO"));
    };
    if version != 1 {
        return Err(ServiceError::permission_denied(format!(
            "unsupported protocol version {version}"
        )));
    }
    if room_id != cfg.room_id {
        return Err(ServiceError::permission_denied("wrong room for this match"));
    }
    let slot = cfg
        .players
        .iter()
        .position(|&(uid, _)| uid == user_id)
        .ok_or_else(|| ServiceError::permission_denied("player not authorized for this match"))?;
    if taken[slot].is_some() {
        return Err(ServiceError::conflict("player already connected"));
    }

    write_frame(
        stream,
        &MatchMessage::Welcome {
            role: cfg.players[slot].1,
            seed: cfg.seed,
            bag_rule: "7bag".to_string(),
            gravity_plan: GravityPlan {
                mode: "fixed".to_string(),
                drop_ms: cfg.drop_ms,
            },
        },
    )
    .await
    .map_err(|e| ServiceError::new(e.kind(), e.to_string()))?;
    Ok(slot)
}

/// Drain one player's connection into the shared input queue. Frames with
/// the wrong user, stale `seq`, or an unknown action are dropped; a read
/// failure of any kind counts as a disconnect.
async fn read_inputs(
    mut reader: OwnedReadHalf,
    slot: usize,
    expected_user: u64,
    tx: mpsc::UnboundedSender<InputEvent>,
) {
    let mut last_seq: u64 = 0;
    loop {
        match read_frame::<_, MatchMessage>(&mut reader).await {
            Ok(MatchMessage::Input {
                user_id,
                seq,
                action,
                ..
            }) => {
                if user_id != expected_user {
                    debug!(slot, user_id, "dropping input with mismatched user");
                    continue;
                }
                if seq <= last_seq {
                    debug!(slot, seq, last_seq, "dropping stale input");
                    continue;
                }
                last_seq = seq;
                let Ok(action) = action.parse::<InputAction>() else {
                    debug!(slot, %action, "dropping unknown action");
                    continue;
                };
                if tx.send(InputEvent::Action { slot, action }).is_err() {
                    break;
                }
            }
            Ok(_) => continue,
            Err(e) => {
                if !e.is_disconnect() {
                    debug!(slot, "input stream error: {e}");
                }
                let _ = tx.send(InputEvent::Disconnected { slot });
                break;
            }
        }
    }
}

fn build_snapshot(engine: &mut Engine, tick: u64, player: (u64, Role)) -> Snapshot {
    let active = (!engine.game_over()).then(|| {
        let piece = engine.active();
        ActiveState {
            shape: piece.kind,
            x: piece.x,
            y: piece.y,
            rot: piece.rot,
        }
    });
    Snapshot {
        tick,
        user_id: player.0,
        role: player.1,
        board_rle: engine.board_rle(),
        active,
        hold: engine.hold(),
        next: engine.preview(3),
        score: engine.score(),
        lines: engine.lines(),
        level: engine.level(),
        game_over: engine.game_over(),
        at: now_millis(),
    }
}

/// Write `frames` to every live connection; returns the slots whose writes
/// failed (their connections are dropped).
async fn send_to_all<W>(writers: &mut [Option<W>], frames: &[MatchMessage]) -> Vec<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut failed = Vec::new();
    for (slot, writer) in writers.iter_mut().enumerate() {
        let Some(stream) = writer.as_mut() else {
            continue;
        };
        for frame in frames {
            if write_frame(stream, frame).await.is_err() {
                failed.push(slot);
                *writer = None;
                break;
            }
        }
    }
    failed
}

/// Tell the session service the match is over so it records the log and
/// returns the room to idle. Best-effort with a bounded retry.
async fn report_result(
    cfg: &MatchConfig,
    winner: Option<u64>,
    results: &[PlayerResult],
    start_at: &str,
    end_at: &str,
) {
    let Some(addr) = &cfg.session_addr else {
        return;
    };
    let request = SessionRequest::ReportMatchResult {
        match_id: cfg.match_id.clone(),
        room_id: cfg.room_id,
        winner,
        results: results.to_vec(),
        start_at: start_at.to_string(),
        end_at: end_at.to_string(),
    };
    for attempt in 0..3u32 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("result report attempt {attempt} failed to connect: {e}");
                continue;
            }
        };
        let outcome = async {
            write_frame(&mut stream, &request).await?;
            read_frame_timeout::<_, Response>(&mut stream, Duration::from_secs(5)).await
        }
        .await;
        match outcome {
            Ok(response) if response.is_success() => {
                info!("match result reported");
                return;
            }
            Ok(response) => {
                warn!("session service rejected the result: {}", response.message);
                return;
            }
            Err(e) => warn!("result report attempt {attempt} failed: {e}"),
        }
    }
    error!("giving up on reporting the match result to {addr}");
}
