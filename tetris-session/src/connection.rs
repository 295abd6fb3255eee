//! Accept loop and per-connection read/write tasks.
//!
//! Each connection owns one session. A writer task drains the session's
//! outbound queue (responses and event pushes share it, so frames never
//! interleave); the read loop parses `{action, data}` requests and feeds the
//! handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use tetris_types::framing::{read_frame_timeout, write_frame, FrameError};
use tetris_types::{ErrorKind, Response, ServiceError, SessionRequest};

use crate::handlers::{RequestHandler, SessionShared};
use crate::registry::{Outbound, SessionId};

/// Bounded liveness timeout for idle clients.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(600);

pub async fn serve(listener: TcpListener, shared: Arc<SessionShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("connection from {addr}");
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_connection(stream, shared).await;
                    info!("connection from {addr} closed");
                });
            }
            Err(e) => {
                error!("accept failed: {e}");
            }
        }
    }
}

pub async fn handle_connection(stream: TcpStream, shared: Arc<SessionShared>) {
    let session_id = SessionId::new();
    let (mut reader, mut writer) = stream.into_split();
    let mut outbound = shared.registry.create_session(session_id).await;

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let result = match frame {
                Outbound::Response(response) => write_frame(&mut writer, &response).await,
                Outbound::Event(event) => write_frame(&mut writer, &event).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    let handler = RequestHandler::new(session_id, shared.clone());
    loop {
        let value: serde_json::Value =
            match read_frame_timeout(&mut reader, CLIENT_READ_TIMEOUT).await {
                Ok(value) => value,
                Err(e) if e.is_disconnect() => break,
                Err(FrameError::Timeout) => {
                    warn!(%session_id, "client idle past the read deadline");
                    break;
                }
                Err(e) => {
                    // Bad frame: report once, then close.
                    warn!(%session_id, "dropping connection: {e}");
                    let err = ServiceError::new(e.kind(), e.to_string());
                    shared
                        .registry
                        .send_response(session_id, Response::error(&err))
                        .await;
                    break;
                }
            };

        let response = match serde_json::from_value::<SessionRequest>(value) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Response::error(&ServiceError::new(
                ErrorKind::UnknownAction,
                format!("unrecognized request: {e}"),
            )),
        };

        if !shared.registry.send_response(session_id, response).await {
            break;
        }
    }

    handler.handle_disconnect().await;
    // Removing the session drops the outbound sender, so the writer drains
    // whatever is queued (including a final error frame) and exits.
    shared.registry.remove_session(session_id).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), writer_task).await;
}
