use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{ErrorKind, ServiceError};
use crate::model::{PieceKind, PlayerResult, Role, RoomPatch, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Response envelope shared by the persistence and session services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Response {
    pub fn success(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            data,
        }
    }

    pub fn error(err: &ServiceError) -> Self {
        Self {
            status: Status::Error,
            message: err.message.clone(),
            data: json!({ "kind": err.kind }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Decode the payload of a success response, or rebuild the
    /// `ServiceError` an error response carries.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ServiceError> {
        match self.status {
            Status::Success => serde_json::from_value(self.data).map_err(|e| {
                ServiceError::new(
                    ErrorKind::MalformedFrame,
                    format!("unexpected response payload: {e}"),
                )
            }),
            Status::Error => {
                let kind = self
                    .data
                    .get("kind")
                    .and_then(|k| serde_json::from_value(k.clone()).ok())
                    .unwrap_or(ErrorKind::UnknownAction);
                Err(ServiceError::new(kind, self.message))
            }
        }
    }
}

/// Requests accepted by the persistence service. The `{action, data}` wire
/// envelope maps onto the adjacent tagging; an unknown action fails to parse
/// and is rejected at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum PersistRequest {
    CreateUser {
        name: String,
        email: String,
        password_hash: String,
    },
    LoginUser {
        email: String,
        password_hash: String,
    },
    GetUser {
        id: u64,
    },
    GetUserByEmail {
        email: String,
    },
    CreateRoom {
        name: String,
        host_user_id: u64,
        visibility: Visibility,
    },
    GetRoom {
        id: u64,
    },
    ListRooms {
        #[serde(default)]
        visibility: Option<Visibility>,
    },
    UpdateRoom {
        id: u64,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: u64,
    },
    CreateGameLog {
        match_id: String,
        room_id: u64,
        users: Vec<u64>,
        start_at: String,
        end_at: String,
        results: Vec<PlayerResult>,
    },
    ListGameLogs {
        #[serde(default)]
        user_id: Option<u64>,
    },
}

/// Requests accepted by the session service. `ReportMatchResult` is the
/// control-channel action used by match servers, not by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum SessionRequest {
    Register {
        name: String,
        email: String,
        password: String,
    },
    Login {
        email: String,
        password: String,
    },
    Logout,
    ListOnlineUsers,
    ListRooms,
    CreateRoom {
        name: String,
        visibility: Visibility,
    },
    JoinRoom {
        room_id: u64,
    },
    LeaveRoom,
    Invite {
        room_id: u64,
        user_id: u64,
    },
    StartGame {
        room_id: u64,
    },
    Kick {
        room_id: u64,
        user_id: u64,
    },
    MatchHistory,
    ReportMatchResult {
        match_id: String,
        room_id: u64,
        winner: Option<u64>,
        results: Vec<PlayerResult>,
        start_at: String,
        end_at: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomChange {
    UserJoined,
    UserLeft,
    UserKicked,
    RoomClosed,
    MatchEnded,
}

/// Unsolicited frames pushed by the session service to a client, using the
/// `{event, data}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Invited {
        room_id: u64,
        room_name: String,
        from_user_id: u64,
        from_user_name: String,
    },
    MatchReady {
        host: String,
        port: u16,
        match_id: String,
        role: Role,
    },
    RoomUpdate {
        room_id: u64,
        change: RoomChange,
        #[serde(default)]
        user_id: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GravityPlan {
    pub mode: String,
    #[serde(rename = "dropMs")]
    pub drop_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveState {
    pub shape: PieceKind,
    pub x: i32,
    pub y: i32,
    pub rot: u8,
}

/// One player's view of the authoritative state at the end of a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub tick: u64,
    pub user_id: u64,
    pub role: Role,
    #[serde(rename = "boardRLE")]
    pub board_rle: String,
    pub active: Option<ActiveState>,
    pub hold: Option<PieceKind>,
    pub next: Vec<PieceKind>,
    pub score: u32,
    pub lines: u32,
    pub level: u32,
    pub game_over: bool,
    pub at: u64,
}

/// Match protocol frames, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MatchMessage {
    #[serde(rename = "HELLO")]
    Hello {
        version: u32,
        #[serde(rename = "roomId")]
        room_id: u64,
        #[serde(rename = "userId")]
        user_id: u64,
    },
    #[serde(rename = "WELCOME")]
    Welcome {
        role: Role,
        seed: u64,
        #[serde(rename = "bagRule")]
        bag_rule: String,
        #[serde(rename = "gravityPlan")]
        gravity_plan: GravityPlan,
    },
    #[serde(rename = "INPUT")]
    Input {
        #[serde(rename = "userId")]
        user_id: u64,
        seq: u64,
        ts: u64,
        action: String,
    },
    #[serde(rename = "SNAPSHOT")]
    Snapshot(Snapshot),
    #[serde(rename = "GAME_OVER")]
    GameOver {
        winner: Option<u64>,
        results: Vec<PlayerResult>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_request_uses_action_data_envelope() {
        let raw = json!({
            "action": "join_room",
            "data": { "room_id": 7 }
        });
        let req: SessionRequest = serde_json::from_value(raw).unwrap();
        assert!(matches!(req, SessionRequest::JoinRoom { room_id: 7 }));
    }

    #[test]
    fn payload_free_actions_accept_missing_data() {
        let req: SessionRequest = serde_json::from_value(json!({ "action": "logout" })).unwrap();
        assert!(matches!(req, SessionRequest::Logout));
    }

    #[test]
    fn unknown_actions_are_rejected_at_parse() {
        let raw = json!({ "action": "spectate_game", "data": {} });
        assert!(serde_json::from_value::<SessionRequest>(raw).is_err());
    }

    #[test]
    fn error_response_round_trips_kind() {
        let err = ServiceError::new(ErrorKind::Capacity, "room is full");
        let resp = Response::error(&err);
        let back = resp.into_result::<serde_json::Value>().unwrap_err();
        assert_eq!(back.kind, ErrorKind::Capacity);
        assert_eq!(back.message, "room is full");
    }

    #[test]
    fn match_messages_use_uppercase_tags() {
        let hello = MatchMessage::Hello {
            version: 1,
            room_id: 3,
            user_id: 12,
        };
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value["type"], "HELLO");
        assert_eq!(value["roomId"], 3);
        assert_eq!(value["userId"], 12);
    }

    #[test]
    fn snapshot_field_names_match_wire_format() {
        let snapshot = Snapshot {
            tick: 4,
            user_id: 9,
            role: Role::P2,
            board_rle: "0x200".to_string(),
            active: Some(ActiveState {
                shape: PieceKind::T,
                x: 4,
                y: 0,
                rot: 0,
            }),
            hold: None,
            next: vec![PieceKind::I, PieceKind::O, PieceKind::L],
            score: 0,
            lines: 0,
            level: 1,
            game_over: false,
            at: 0,
        };
        let value = serde_json::to_value(MatchMessage::Snapshot(snapshot)).unwrap();
        assert_eq!(value["type"], "SNAPSHOT");
        assert_eq!(value["boardRLE"], "0x200");
        assert_eq!(value["gameOver"], false);
        assert_eq!(value["active"]["shape"], "T");
        assert_eq!(value["next"], json!(["I", "O", "L"]));
    }
}
