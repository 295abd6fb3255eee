//! Framed request/response front end over the storage.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use tetris_types::framing::{read_frame_timeout, write_frame, FrameError};
use tetris_types::{ErrorKind, PersistRequest, Response, ServiceError};

use crate::storage::Storage;

/// Bounded liveness timeout for idle client connections.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn run(listener: TcpListener, storage: Arc<Storage>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("connection from {addr}");
                let storage = storage.clone();
                tokio::spawn(async move {
                    handle_client(stream, storage).await;
                    info!("connection from {addr} closed");
                });
            }
            Err(e) => {
                error!("accept failed: {e}");
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, storage: Arc<Storage>) {
    loop {
        let value: serde_json::Value =
            match read_frame_timeout(&mut stream, CLIENT_READ_TIMEOUT).await {
                Ok(value) => value,
                Err(e) if e.is_disconnect() => break,
                Err(FrameError::Timeout) => {
                    warn!("client idle past the read deadline");
                    break;
                }
                Err(e) => {
                    // Bad frame: report once, then close.
                    warn!("dropping connection: {e}");
                    let err = ServiceError::new(e.kind(), e.to_string());
                    let _ = write_frame(&mut stream, &Response::error(&err)).await;
                    break;
                }
            };

        let response = match serde_json::from_value::<PersistRequest>(value) {
            Ok(request) => dispatch(&storage, request).await,
            Err(e) => Response::error(&ServiceError::new(
                ErrorKind::UnknownAction,
                format!("unrecognized request: {e}"),
            )),
        };

        if write_frame(&mut stream, &response).await.is_err() {
            break;
        }
    }
}

async fn dispatch(storage: &Storage, request: PersistRequest) -> Response {
    let result = match request {
        PersistRequest::CreateUser {
            name,
            email,
            password_hash,
        } => storage
            .create_user(name, email, password_hash)
            .await
            .map(|user| ("user created", json!(user))),
        PersistRequest::LoginUser {
            email,
            password_hash,
        } => storage
            .login_user(&email, &password_hash)
            .await
            .map(|user| ("login ok", json!(user))),
        PersistRequest::GetUser { id } => storage
            .get_user(id)
            .await
            .map(|user| ("ok", json!(user))),
        PersistRequest::GetUserByEmail { email } => storage
            .get_user_by_email(&email)
            .await
            .map(|user| ("ok", json!(user))),
        PersistRequest::CreateRoom {
            name,
            host_user_id,
            visibility,
        } => storage
            .create_room(name, host_user_id, visibility)
            .await
            .map(|room| ("room created", json!(room))),
        PersistRequest::GetRoom { id } => storage
            .get_room(id)
            .await
            .map(|room| ("ok", json!(room))),
        PersistRequest::ListRooms { visibility } => {
            Ok(("ok", json!(storage.list_rooms(visibility).await)))
        }
        PersistRequest::UpdateRoom { id, patch } => storage
            .update_room(id, patch)
            .await
            .map(|room| ("room updated", json!(room))),
        PersistRequest::DeleteRoom { id } => storage
            .delete_room(id)
            .await
            .map(|()| ("room deleted", json!({}))),
        PersistRequest::CreateGameLog {
            match_id,
            room_id,
            users,
            start_at,
            end_at,
            results,
        } => storage
            .create_game_log(match_id, room_id, users, start_at, end_at, results)
            .await
            .map(|log| ("log created", json!(log))),
        PersistRequest::ListGameLogs { user_id } => {
            Ok(("ok", json!(storage.list_game_logs(user_id).await)))
        }
    };

    match result {
        Ok((message, data)) => Response::success(message, data),
        Err(err) => Response::error(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetris_types::framing::read_frame;
    use tetris_types::{User, Visibility};

    async fn start_service() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(listener, Arc::new(Storage::in_memory())));
        addr
    }

    #[tokio::test]
    async fn create_and_fetch_over_the_wire() {
        let addr = start_service().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        write_frame(
            &mut stream,
            &PersistRequest::CreateUser {
                name: "Alice".to_string(),
                email: "alice@x".to_string(),
                password_hash: "h".to_string(),
            },
        )
        .await
        .unwrap();
        let created: Response = read_frame(&mut stream).await.unwrap();
        let created: User = created.into_result().unwrap();
        assert_eq!(created.id, 1);

        write_frame(
            &mut stream,
            &PersistRequest::GetUserByEmail {
                email: "ALICE@X".to_string(),
            },
        )
        .await
        .unwrap();
        let fetched: Response = read_frame(&mut stream).await.unwrap();
        let fetched: User = fetched.into_result().unwrap();
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn unknown_action_keeps_connection_open() {
        let addr = start_service().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        write_frame(
            &mut stream,
            &serde_json::json!({ "action": "drop_everything", "data": {} }),
        )
        .await
        .unwrap();
        let resp: Response = read_frame(&mut stream).await.unwrap();
        let err = resp.into_result::<serde_json::Value>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownAction);

        // Connection still serves valid requests.
        write_frame(
            &mut stream,
            &PersistRequest::CreateRoom {
                name: "R".to_string(),
                host_user_id: 1,
                visibility: Visibility::Public,
            },
        )
        .await
        .unwrap();
        let resp: Response = read_frame(&mut stream).await.unwrap();
        assert!(resp.is_success());
    }
}
