//! Durable state: users, rooms, and match logs behind one mutex.
//!
//! All mutations serialize on the lock; each mutation rewrites the touched
//! JSON file before the lock is released, so readers always observe a state
//! that matches the disk. With no data directory the store is memory-only
//! (used by tests).

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::info;

use tetris_types::{
    now_iso, ErrorKind, MatchLog, PlayerResult, Room, RoomPatch, RoomStatus, ServiceError, User,
    Visibility,
};

const USERS_FILE: &str = "users.json";
const ROOMS_FILE: &str = "rooms.json";
const GAMELOGS_FILE: &str = "gamelogs.json";

#[derive(Debug, Default)]
struct State {
    users: Vec<User>,
    rooms: Vec<Room>,
    logs: Vec<MatchLog>,
    next_user_id: u64,
    next_room_id: u64,
    next_log_id: u64,
}

pub struct Storage {
    state: Mutex<State>,
    data_dir: Option<PathBuf>,
}

fn load_file<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn unavailable(err: impl std::fmt::Display) -> ServiceError {
    ServiceError::new(ErrorKind::PersistenceUnavailable, err.to_string())
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(State {
                next_user_id: 1,
                next_room_id: 1,
                next_log_id: 1,
                ..State::default()
            }),
            data_dir: None,
        }
    }

    /// Load (or initialize) the three JSON files under `dir`. Id counters
    /// resume past the highest id ever written, so ids are never reused.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let users: Vec<User> = load_file(&dir.join(USERS_FILE))?;
        let rooms: Vec<Room> = load_file(&dir.join(ROOMS_FILE))?;
        let logs: Vec<MatchLog> = load_file(&dir.join(GAMELOGS_FILE))?;
        info!(
            users = users.len(),
            rooms = rooms.len(),
            logs = logs.len(),
            "loaded storage from {}",
            dir.display()
        );
        let state = State {
            next_user_id: users.iter().map(|u| u.id).max().unwrap_or(0) + 1,
            next_room_id: rooms.iter().map(|r| r.id).max().unwrap_or(0) + 1,
            next_log_id: logs.iter().map(|l| l.id).max().unwrap_or(0) + 1,
            users,
            rooms,
            logs,
        };
        Ok(Self {
            state: Mutex::new(state),
            data_dir: Some(dir),
        })
    }

    fn persist<T: serde::Serialize>(&self, file: &str, records: &[T]) -> Result<(), ServiceError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let body = serde_json::to_string_pretty(records).map_err(unavailable)?;
        std::fs::write(dir.join(file), body).map_err(unavailable)
    }

    pub async fn create_user(
        &self,
        name: String,
        email: String,
        password_hash: String,
    ) -> Result<User, ServiceError> {
        let mut state = self.state.lock().await;
        if state
            .users
            .iter()
            .any(|u| u.email.eq_ignore_ascii_case(&email))
        {
            return Err(ServiceError::conflict("email already taken"));
        }
        let user = User {
            id: state.next_user_id,
            name,
            email,
            password_hash,
            created_at: now_iso(),
            last_login_at: None,
        };
        state.next_user_id += 1;
        state.users.push(user.clone());
        self.persist(USERS_FILE, &state.users)?;
        Ok(user)
    }

    pub async fn login_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<User, ServiceError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .iter_mut()
            .find(|u| u.email.eq_ignore_ascii_case(email) && u.password_hash == password_hash)
            .ok_or_else(|| {
                ServiceError::new(ErrorKind::InvalidCredentials, "invalid email or password")
            })?;
        user.last_login_at = Some(now_iso());
        let user = user.clone();
        self.persist(USERS_FILE, &state.users)?;
        Ok(user)
    }

    pub async fn get_user(&self, id: u64) -> Result<User, ServiceError> {
        let state = self.state.lock().await;
        state
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("no user with id {id}")))
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<User, ServiceError> {
        let state = self.state.lock().await;
        state
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("no user with email {email}")))
    }

    pub async fn create_room(
        &self,
        name: String,
        host_user_id: u64,
        visibility: Visibility,
    ) -> Result<Room, ServiceError> {
        let mut state = self.state.lock().await;
        let room = Room {
            id: state.next_room_id,
            name,
            host_user_id,
            visibility,
            invite_list: Vec::new(),
            members: vec![host_user_id],
            status: RoomStatus::Idle,
            created_at: now_iso(),
        };
        state.next_room_id += 1;
        state.rooms.push(room.clone());
        self.persist(ROOMS_FILE, &state.rooms)?;
        Ok(room)
    }

    pub async fn get_room(&self, id: u64) -> Result<Room, ServiceError> {
        let state = self.state.lock().await;
        state
            .rooms
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("no room with id {id}")))
    }

    pub async fn list_rooms(&self, visibility: Option<Visibility>) -> Vec<Room> {
        let state = self.state.lock().await;
        state
            .rooms
            .iter()
            .filter(|r| visibility.is_none_or(|v| r.visibility == v))
            .cloned()
            .collect()
    }

    pub async fn update_room(&self, id: u64, patch: RoomPatch) -> Result<Room, ServiceError> {
        let mut state = self.state.lock().await;
        let room = state
            .rooms
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ServiceError::not_found(format!("no room with id {id}")))?;
        if let Some(members) = &patch.members {
            if members.is_empty() || members.len() > 2 {
                return Err(ServiceError::invalid_state(
                    "room membership must hold one or two players",
                ));
            }
        }
        if let Some(members) = patch.members {
            room.members = members;
        }
        if let Some(status) = patch.status {
            room.status = status;
        }
        if let Some(invite_list) = patch.invite_list {
            room.invite_list = invite_list;
        }
        let room = room.clone();
        self.persist(ROOMS_FILE, &state.rooms)?;
        Ok(room)
    }

    pub async fn delete_room(&self, id: u64) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        let before = state.rooms.len();
        state.rooms.retain(|r| r.id != id);
        if state.rooms.len() == before {
            return Err(ServiceError::not_found(format!("no room with id {id}")));
        }
        self.persist(ROOMS_FILE, &state.rooms)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_game_log(
        &self,
        match_id: String,
        room_id: u64,
        users: Vec<u64>,
        start_at: String,
        end_at: String,
        results: Vec<PlayerResult>,
    ) -> Result<MatchLog, ServiceError> {
        let mut state = self.state.lock().await;
        let log = MatchLog {
            id: state.next_log_id,
            match_id,
            room_id,
            users,
            start_at,
            end_at,
            results,
        };
        state.next_log_id += 1;
        state.logs.push(log.clone());
        self.persist(GAMELOGS_FILE, &state.logs)?;
        Ok(log)
    }

    pub async fn list_game_logs(&self, user_id: Option<u64>) -> Vec<MatchLog> {
        let state = self.state.lock().await;
        state
            .logs
            .iter()
            .filter(|l| user_id.is_none_or(|id| l.users.contains(&id)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn user(storage: &Storage, email: &str) -> User {
        storage
            .create_user("Tester".to_string(), email.to_string(), "h".to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn created_user_is_found_by_email() {
        let storage = Storage::in_memory();
        let created = user(&storage, "alice@x").await;
        let fetched = storage.get_user_by_email("alice@x").await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.email, created.email);
        assert!(fetched.last_login_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_email_differing_in_case_is_rejected() {
        let storage = Storage::in_memory();
        user(&storage, "alice@x").await;
        let err = storage
            .create_user("Other".to_string(), "ALICE@X".to_string(), "h".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn login_stamps_last_login_and_checks_hash() {
        let storage = Storage::in_memory();
        user(&storage, "bob@x").await;

        let err = storage.login_user("bob@x", "wrong").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCredentials);

        let logged_in = storage.login_user("bob@x", "h").await.unwrap();
        assert!(logged_in.last_login_at.is_some());
    }

    #[tokio::test]
    async fn update_room_on_unknown_id_is_not_found() {
        let storage = Storage::in_memory();
        let err = storage
            .update_room(999, RoomPatch::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn room_membership_capacity_is_enforced() {
        let storage = Storage::in_memory();
        let host = user(&storage, "host@x").await;
        let room = storage
            .create_room("R".to_string(), host.id, Visibility::Public)
            .await
            .unwrap();
        assert_eq!(room.members, vec![host.id]);
        assert_eq!(room.status, RoomStatus::Idle);

        let err = storage
            .update_room(
                room.id,
                RoomPatch {
                    members: Some(vec![1, 2, 3]),
                    ..RoomPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn game_logs_filter_by_user() {
        let storage = Storage::in_memory();
        storage
            .create_game_log(
                "m1".to_string(),
                1,
                vec![10, 11],
                now_iso(),
                now_iso(),
                vec![],
            )
            .await
            .unwrap();
        storage
            .create_game_log(
                "m2".to_string(),
                2,
                vec![11, 12],
                now_iso(),
                now_iso(),
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(storage.list_game_logs(None).await.len(), 2);
        assert_eq!(storage.list_game_logs(Some(10)).await.len(), 1);
        assert_eq!(storage.list_game_logs(Some(11)).await.len(), 2);
        assert!(storage.list_game_logs(Some(99)).await.is_empty());
    }

    #[tokio::test]
    async fn ids_stay_monotonic_across_reload() {
        let dir = tempfile::tempdir().unwrap();

        let first = Storage::open(dir.path()).unwrap();
        let alice = user(&first, "alice@x").await;
        let room = first
            .create_room("R".to_string(), alice.id, Visibility::Public)
            .await
            .unwrap();
        first.delete_room(room.id).await.unwrap();
        drop(first);

        let second = Storage::open(dir.path()).unwrap();
        let bob = second
            .create_user("Bob".to_string(), "bob@x".to_string(), "h".to_string())
            .await
            .unwrap();
        assert_eq!(bob.id, alice.id + 1);
        // Reloaded users survive and stay queryable.
        assert!(second.get_user_by_email("alice@x").await.is_ok());
    }
}
