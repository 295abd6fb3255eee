//! Spawns and tracks per-match game server processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use tetris_types::{ErrorKind, ServiceError};

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Path to the `tetris-match` executable.
    pub match_bin: PathBuf,
    /// First port of the allocation pool.
    pub port_base: u16,
    /// Number of ports in the pool.
    pub port_span: u16,
    /// Address the match server reports results back to.
    pub session_addr: String,
    /// A child past this age is killed and its match abandoned.
    pub max_match_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct LaunchedMatch {
    pub match_id: String,
    pub port: u16,
    pub seed: u64,
}

struct ActiveMatch {
    match_id: String,
    monitor: tokio::task::JoinHandle<()>,
}

type ActiveMap = Arc<Mutex<HashMap<u64, ActiveMatch>>>;

pub struct MatchLauncher {
    config: LauncherConfig,
    active: ActiveMap,
}

impl MatchLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate a port and a seed, spawn a match server for `room_id`, and
    /// start a monitor that reaps (or kills) the child.
    pub async fn launch(
        &self,
        room_id: u64,
        host_id: u64,
        guest_id: u64,
    ) -> Result<LaunchedMatch, ServiceError> {
        let mut active = self.active.lock().await;
        if active.contains_key(&room_id) {
            return Err(ServiceError::invalid_state(
                "a match is already running for this room",
            ));
        }

        let port = self.find_free_port().await.ok_or_else(|| {
            ServiceError::new(ErrorKind::LauncherError, "no free port in the match pool")
        })?;
        let seed: u64 = rand::random();
        let match_id = Uuid::new_v4().to_string();

        let child = Command::new(&self.config.match_bin)
            .arg("--port")
            .arg(port.to_string())
            .arg("--match-id")
            .arg(&match_id)
            .arg("--room-id")
            .arg(room_id.to_string())
            .arg("--seed")
            .arg(seed.to_string())
            .arg("--player")
            .arg(format!("{host_id}:P1"))
            .arg("--player")
            .arg(format!("{guest_id}:P2"))
            .arg("--session-addr")
            .arg(&self.config.session_addr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ServiceError::new(
                    ErrorKind::LauncherError,
                    format!(
                        "failed to spawn {}: {e}",
                        self.config.match_bin.display()
                    ),
                )
            })?;

        info!(
            room_id,
            port,
            %match_id,
            "spawned match server (pid {:?})",
            child.id()
        );

        let monitor = tokio::spawn(monitor_child(
            child,
            room_id,
            self.config.max_match_duration,
            self.active.clone(),
        ));
        active.insert(room_id, ActiveMatch { match_id: match_id.clone(), monitor });

        Ok(LaunchedMatch {
            match_id,
            port,
            seed,
        })
    }

    /// Kill the match for `room_id`, if any. Used to unwind a failed start.
    pub async fn abort(&self, room_id: u64) {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.remove(&room_id) {
            warn!(room_id, match_id = %entry.match_id, "aborting match");
            // Dropping the child via the aborted monitor kills the process.
            entry.monitor.abort();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn shutdown_all(&self) {
        let mut active = self.active.lock().await;
        for (room_id, entry) in active.drain() {
            info!(room_id, match_id = %entry.match_id, "stopping match server");
            entry.monitor.abort();
        }
    }

    async fn find_free_port(&self) -> Option<u16> {
        let end = self.config.port_base.saturating_add(self.config.port_span);
        for port in self.config.port_base..end {
            if TcpListener::bind(("0.0.0.0", port)).await.is_ok() {
                return Some(port);
            }
        }
        None
    }
}

async fn monitor_child(mut child: Child, room_id: u64, max_duration: Duration, active: ActiveMap) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(room_id, "match server exited with {status}"),
            Err(e) => warn!(room_id, "failed to reap match server: {e}"),
        },
        _ = tokio::time::sleep(max_duration) => {
            warn!(room_id, "match server overran the duration cap, killing it");
            let _ = child.kill().await;
        }
    }
    active.lock().await.remove(&room_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LauncherConfig {
        LauncherConfig {
            match_bin: PathBuf::from("/nonexistent/tetris-match"),
            port_base: 10100,
            port_span: 16,
            session_addr: "localhost:10002".to_string(),
            max_match_duration: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_launcher_error() {
        let launcher = MatchLauncher::new(test_config());
        let err = launcher.launch(1, 10, 11).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LauncherError);
        assert_eq!(launcher.active_count().await, 0);
    }

    #[tokio::test]
    async fn exhausted_port_pool_is_a_launcher_error() {
        let mut config = test_config();
        config.port_base = 10180;
        config.port_span = 1;
        // Occupy the single pool port.
        let _holder = TcpListener::bind(("0.0.0.0", config.port_base)).await.unwrap();
        let launcher = MatchLauncher::new(config);
        let err = launcher.launch(1, 10, 11).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LauncherError);
    }
}
