use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registered account. `password_hash` is an opaque verifier supplied by the
/// session service; the store never sees a plaintext password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: String, // ISO 8601 string
    pub last_login_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Idle,
    Playing,
}

/// Match lobby. Members are ordered host first; capacity is two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: u64,
    pub name: String,
    pub host_user_id: u64,
    pub visibility: Visibility,
    pub invite_list: Vec<u64>,
    pub members: Vec<u64>,
    pub status: RoomStatus,
    pub created_at: String,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.members.len() >= 2
    }

    pub fn guest(&self) -> Option<u64> {
        self.members
            .iter()
            .copied()
            .find(|&id| id != self.host_user_id)
    }
}

/// Partial update applied by the persistence service's `update_room`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RoomStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_list: Option<Vec<u64>>,
}

/// Final per-player record of a finished match. `max_combo` is reserved and
/// always written as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub user_id: u64,
    pub score: u32,
    pub lines: u32,
    pub max_combo: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchLog {
    pub id: u64,
    pub match_id: String,
    pub room_id: u64,
    pub users: Vec<u64>,
    pub start_at: String,
    pub end_at: String,
    pub results: Vec<PlayerResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    P1,
    P2,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::P1 => write!(f, "P1"),
            Role::P2 => write!(f, "P2"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P1" => Ok(Role::P1),
            "P2" => Ok(Role::P2),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The seven tetromino kinds. Board cells store `code()` (1-7); 0 is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PieceKind {
    I,
    O,
    T,
    S,
    Z,
    J,
    L,
}

impl PieceKind {
    pub const ALL: [PieceKind; 7] = [
        PieceKind::I,
        PieceKind::O,
        PieceKind::T,
        PieceKind::S,
        PieceKind::Z,
        PieceKind::J,
        PieceKind::L,
    ];

    pub fn code(self) -> u8 {
        match self {
            PieceKind::I => 1,
            PieceKind::O => 2,
            PieceKind::T => 3,
            PieceKind::S => 4,
            PieceKind::Z => 5,
            PieceKind::J => 6,
            PieceKind::L => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

/// Player actions accepted by the match protocol. Parsed from the wire via
/// `FromStr` so an unrecognized action string drops that one INPUT frame
/// instead of tearing down the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    Left,
    Right,
    Down,
    Cw,
    Ccw,
    HardDrop,
    Hold,
}

impl InputAction {
    pub fn as_str(self) -> &'static str {
        match self {
            InputAction::Left => "LEFT",
            InputAction::Right => "RIGHT",
            InputAction::Down => "DOWN",
            InputAction::Cw => "CW",
            InputAction::Ccw => "CCW",
            InputAction::HardDrop => "HARD_DROP",
            InputAction::Hold => "HOLD",
        }
    }
}

impl FromStr for InputAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LEFT" => Ok(InputAction::Left),
            "RIGHT" => Ok(InputAction::Right),
            "DOWN" => Ok(InputAction::Down),
            "CW" => Ok(InputAction::Cw),
            "CCW" => Ok(InputAction::Ccw),
            "HARD_DROP" => Ok(InputAction::HardDrop),
            "HOLD" => Ok(InputAction::Hold),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Current wall-clock time as an ISO 8601 string, the format persisted in
/// user, room, and match-log records.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Current wall-clock time in epoch milliseconds, used for advisory `ts`/`at`
/// fields on the match protocol.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_codes_round_trip() {
        for kind in PieceKind::ALL {
            assert_eq!(PieceKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(PieceKind::from_code(0), None);
        assert_eq!(PieceKind::from_code(8), None);
    }

    #[test]
    fn input_actions_parse_exact_wire_strings() {
        for action in [
            InputAction::Left,
            InputAction::Right,
            InputAction::Down,
            InputAction::Cw,
            InputAction::Ccw,
            InputAction::HardDrop,
            InputAction::Hold,
        ] {
            assert_eq!(action.as_str().parse::<InputAction>(), Ok(action));
        }
        assert!("SOFT_DROP".parse::<InputAction>().is_err());
        assert!("left".parse::<InputAction>().is_err());
    }

    #[test]
    fn room_guest_skips_host() {
        let room = Room {
            id: 1,
            name: "R".to_string(),
            host_user_id: 10,
            visibility: Visibility::Public,
            invite_list: vec![],
            members: vec![10, 11],
            status: RoomStatus::Idle,
            created_at: now_iso(),
        };
        assert_eq!(room.guest(), Some(11));
        assert!(room.is_full());
    }
}
