//! Call-site facade over a framed connection to the persistence service.
//!
//! One connection, one in-flight request at a time. Transport failures drop
//! the connection and retry with a short backoff before surfacing
//! `PersistenceUnavailable`; business errors pass through untouched.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use tetris_types::framing::{read_frame_timeout, write_frame};
use tetris_types::{
    ErrorKind, MatchLog, PersistRequest, PlayerResult, Response, Room, RoomPatch, ServiceError,
    User, Visibility,
};

const ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PersistClient {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl PersistClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    /// Eagerly establish the connection so startup can fail fast when the
    /// persistence service is down.
    pub async fn connect(&self) -> Result<(), ServiceError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                ServiceError::new(
                    ErrorKind::PersistenceUnavailable,
                    format!("cannot reach persistence at {}: {e}", self.addr),
                )
            })?;
            *guard = Some(stream);
        }
        Ok(())
    }

    async fn request(&self, request: &PersistRequest) -> Result<Response, ServiceError> {
        let mut guard = self.conn.lock().await;
        for attempt in 0..ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            if guard.is_none() {
                match TcpStream::connect(&self.addr).await {
                    Ok(stream) => *guard = Some(stream),
                    Err(e) => {
                        warn!("persistence connect failed (attempt {attempt}): {e}");
                        continue;
                    }
                }
            }
            let stream = guard.as_mut().expect("connection was just established");
            let outcome = async {
                write_frame(stream, request).await?;
                read_frame_timeout::<_, Response>(stream, RPC_TIMEOUT).await
            }
            .await;
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("persistence rpc failed (attempt {attempt}): {e}");
                    *guard = None;
                }
            }
        }
        Err(ServiceError::new(
            ErrorKind::PersistenceUnavailable,
            format!("persistence at {} is unavailable", self.addr),
        ))
    }

    async fn call<T: DeserializeOwned>(&self, request: PersistRequest) -> Result<T, ServiceError> {
        self.request(&request).await?.into_result()
    }

    pub async fn create_user(
        &self,
        name: String,
        email: String,
        password_hash: String,
    ) -> Result<User, ServiceError> {
        self.call(PersistRequest::CreateUser {
            name,
            email,
            password_hash,
        })
        .await
    }

    pub async fn login_user(
        &self,
        email: String,
        password_hash: String,
    ) -> Result<User, ServiceError> {
        self.call(PersistRequest::LoginUser {
            email,
            password_hash,
        })
        .await
    }

    pub async fn get_user(&self, id: u64) -> Result<User, ServiceError> {
        self.call(PersistRequest::GetUser { id }).await
    }

    pub async fn get_user_by_email(&self, email: String) -> Result<User, ServiceError> {
        self.call(PersistRequest::GetUserByEmail { email }).await
    }

    pub async fn create_room(
        &self,
        name: String,
        host_user_id: u64,
        visibility: Visibility,
    ) -> Result<Room, ServiceError> {
        self.call(PersistRequest::CreateRoom {
            name,
            host_user_id,
            visibility,
        })
        .await
    }

    pub async fn get_room(&self, id: u64) -> Result<Room, ServiceError> {
        self.call(PersistRequest::GetRoom { id }).await
    }

    pub async fn list_rooms(
        &self,
        visibility: Option<Visibility>,
    ) -> Result<Vec<Room>, ServiceError> {
        self.call(PersistRequest::ListRooms { visibility }).await
    }

    pub async fn update_room(&self, id: u64, patch: RoomPatch) -> Result<Room, ServiceError> {
        self.call(PersistRequest::UpdateRoom { id, patch }).await
    }

    pub async fn delete_room(&self, id: u64) -> Result<(), ServiceError> {
        self.call::<serde_json::Value>(PersistRequest::DeleteRoom { id })
            .await?;
        Ok(())
    }

    pub async fn create_game_log(
        &self,
        match_id: String,
        room_id: u64,
        users: Vec<u64>,
        start_at: String,
        end_at: String,
        results: Vec<PlayerResult>,
    ) -> Result<MatchLog, ServiceError> {
        self.call(PersistRequest::CreateGameLog {
            match_id,
            room_id,
            users,
            start_at,
            end_at,
            results,
        })
        .await
    }

    pub async fn list_game_logs(
        &self,
        user_id: Option<u64>,
    ) -> Result<Vec<MatchLog>, ServiceError> {
        self.call(PersistRequest::ListGameLogs { user_id }).await
    }
}
