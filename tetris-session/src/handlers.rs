//! Per-action request handling for the session service.

use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use tetris_persistence::PersistClient;
use tetris_types::{
    ErrorKind, PlayerResult, Response, Role, RoomChange, RoomPatch, RoomStatus, ServiceError,
    SessionEvent, SessionRequest, Visibility,
};

use crate::launcher::MatchLauncher;
use crate::registry::{Registry, SessionId};

pub struct SessionShared {
    pub registry: Registry,
    pub persist: PersistClient,
    pub launcher: MatchLauncher,
    /// Host name clients are told to reach match servers on.
    pub advertise_host: String,
    /// Serializes read-check-update sequences on room records, so two
    /// concurrent joins cannot both see the last free slot.
    room_ops: Mutex<()>,
}

impl SessionShared {
    pub fn new(
        registry: Registry,
        persist: PersistClient,
        launcher: MatchLauncher,
        advertise_host: String,
    ) -> Self {
        Self {
            registry,
            persist,
            launcher,
            advertise_host,
            room_ops: Mutex::new(()),
        }
    }
}

fn digest_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

type HandlerResult = Result<(&'static str, serde_json::Value), ServiceError>;

pub struct RequestHandler {
    session_id: SessionId,
    shared: Arc<SessionShared>,
}

impl RequestHandler {
    pub fn new(session_id: SessionId, shared: Arc<SessionShared>) -> Self {
        Self { session_id, shared }
    }

    pub async fn handle(&self, request: SessionRequest) -> Response {
        let result = match request {
            SessionRequest::Register {
                name,
                email,
                password,
            } => self.register(name, email, password).await,
            SessionRequest::Login { email, password } => self.login(email, password).await,
            SessionRequest::Logout => self.logout().await,
            SessionRequest::ListOnlineUsers => self.list_online_users().await,
            SessionRequest::ListRooms => self.list_rooms().await,
            SessionRequest::CreateRoom { name, visibility } => {
                self.create_room(name, visibility).await
            }
            SessionRequest::JoinRoom { room_id } => self.join_room(room_id).await,
            SessionRequest::LeaveRoom => self.leave_room().await,
            SessionRequest::Invite { room_id, user_id } => self.invite(room_id, user_id).await,
            SessionRequest::StartGame { room_id } => self.start_game(room_id).await,
            SessionRequest::Kick { room_id, user_id } => self.kick(room_id, user_id).await,
            SessionRequest::MatchHistory => self.match_history().await,
            SessionRequest::ReportMatchResult {
                match_id,
                room_id,
                winner,
                results,
                start_at,
                end_at,
            } => {
                self.report_match_result(match_id, room_id, winner, results, start_at, end_at)
                    .await
            }
        };

        match result {
            Ok((message, data)) => Response::success(message, data),
            Err(err) => Response::error(&err),
        }
    }

    /// Disconnect is the canonical cancel: log the user out and leave any
    /// idle room. A playing room stays frozen; the match server's forfeit
    /// flow returns it to idle.
    pub async fn handle_disconnect(&self) {
        if let Some((user_id, _)) = self.shared.registry.session_user(self.session_id).await {
            if let Err(e) = self.leave_current_room(user_id).await {
                if e.kind != ErrorKind::InvalidState {
                    warn!(user_id, "cleanup on disconnect failed: {e}");
                }
            }
            self.shared.registry.unbind_user(self.session_id).await;
            info!(user_id, "session closed");
        }
    }

    async fn require_user(&self) -> Result<(u64, String), ServiceError> {
        self.shared
            .registry
            .session_user(self.session_id)
            .await
            .ok_or_else(|| ServiceError::unauthenticated("login required"))
    }

    async fn register(&self, name: String, email: String, password: String) -> HandlerResult {
        if self
            .shared
            .registry
            .session_user(self.session_id)
            .await
            .is_some()
        {
            return Err(ServiceError::invalid_state("already logged in"));
        }
        let user = self
            .shared
            .persist
            .create_user(name, email, digest_password(&password))
            .await?;
        info!(user_id = user.id, "registered {}", user.email);
        Ok(("registered", json!({ "user_id": user.id })))
    }

    async fn login(&self, email: String, password: String) -> HandlerResult {
        if self
            .shared
            .registry
            .session_user(self.session_id)
            .await
            .is_some()
        {
            return Err(ServiceError::invalid_state("already logged in"));
        }
        let user = self
            .shared
            .persist
            .login_user(email, digest_password(&password))
            .await?;
        self.shared
            .registry
            .bind_user(self.session_id, user.id, user.name.clone())
            .await?;
        info!(user_id = user.id, "logged in {}", user.name);
        Ok((
            "logged in",
            json!({ "user_id": user.id, "name": user.name }),
        ))
    }

    async fn logout(&self) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;
        if let Err(e) = self.leave_current_room(user_id).await {
            if e.kind != ErrorKind::InvalidState {
                return Err(e);
            }
        }
        self.shared.registry.unbind_user(self.session_id).await;
        Ok(("logged out", json!({})))
    }

    async fn list_online_users(&self) -> HandlerResult {
        self.require_user().await?;
        let users: Vec<_> = self
            .shared
            .registry
            .online_users()
            .await
            .into_iter()
            .map(|(user_id, name)| json!({ "user_id": user_id, "name": name }))
            .collect();
        Ok(("ok", json!(users)))
    }

    async fn list_rooms(&self) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;
        let rooms: Vec<_> = self
            .shared
            .persist
            .list_rooms(None)
            .await?
            .into_iter()
            .filter(|room| {
                room.visibility == Visibility::Public
                    || room.members.contains(&user_id)
                    || room.invite_list.contains(&user_id)
            })
            .collect();
        Ok(("ok", json!(rooms)))
    }

    async fn create_room(&self, name: String, visibility: Visibility) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;
        if self
            .shared
            .registry
            .session_room(self.session_id)
            .await
            .is_some()
        {
            return Err(ServiceError::invalid_state("already in a room"));
        }
        let room = self
            .shared
            .persist
            .create_room(name, user_id, visibility)
            .await?;
        self.shared
            .registry
            .set_room(self.session_id, Some(room.id))
            .await;
        info!(user_id, room_id = room.id, "created room '{}'", room.name);
        Ok(("room created", json!(room)))
    }

    async fn join_room(&self, room_id: u64) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;
        if self
            .shared
            .registry
            .session_room(self.session_id)
            .await
            .is_some()
        {
            return Err(ServiceError::invalid_state("already in a room"));
        }

        let _guard = self.shared.room_ops.lock().await;
        let room = self.shared.persist.get_room(room_id).await?;
        if room.status == RoomStatus::Playing {
            return Err(ServiceError::invalid_state("room is in a match"));
        }
        if room.members.contains(&user_id) {
            return Err(ServiceError::conflict("already in the room"));
        }
        if room.visibility == Visibility::Private
            && user_id != room.host_user_id
            && !room.invite_list.contains(&user_id)
        {
            return Err(ServiceError::permission_denied(
                "this room is private; an invite is required",
            ));
        }
        if room.is_full() {
            return Err(ServiceError::new(ErrorKind::Capacity, "room is full"));
        }

        let mut members = room.members.clone();
        members.push(user_id);
        let updated = self
            .shared
            .persist
            .update_room(
                room_id,
                RoomPatch {
                    members: Some(members),
                    ..RoomPatch::default()
                },
            )
            .await?;
        self.shared
            .registry
            .set_room(self.session_id, Some(room_id))
            .await;
        info!(user_id, room_id, "joined room");

        self.shared
            .registry
            .send_event_to_user(
                room.host_user_id,
                SessionEvent::RoomUpdate {
                    room_id,
                    change: RoomChange::UserJoined,
                    user_id: Some(user_id),
                },
            )
            .await;
        Ok(("joined room", json!(updated)))
    }

    async fn leave_room(&self) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;
        self.leave_current_room(user_id).await?;
        Ok(("left room", json!({})))
    }

    /// Shared by leave_room, logout, and disconnect cleanup. Leaving as host
    /// of an idle room disbands it.
    async fn leave_current_room(&self, user_id: u64) -> Result<(), ServiceError> {
        let room_id = self
            .shared
            .registry
            .session_room(self.session_id)
            .await
            .ok_or_else(|| ServiceError::invalid_state("not in a room"))?;

        let _guard = self.shared.room_ops.lock().await;
        let room = match self.shared.persist.get_room(room_id).await {
            Ok(room) => room,
            Err(e) if e.kind == ErrorKind::NotFound => {
                // Room already disbanded; just drop the local reference.
                self.shared.registry.set_room(self.session_id, None).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if room.status == RoomStatus::Playing {
            return Err(ServiceError::invalid_state(
                "membership is frozen while the match runs",
            ));
        }

        if user_id == room.host_user_id {
            self.shared.persist.delete_room(room_id).await?;
            for member in &room.members {
                self.shared.registry.set_room_for_user(*member, None).await;
            }
            if let Some(guest) = room.guest() {
                self.shared
                    .registry
                    .send_event_to_user(
                        guest,
                        SessionEvent::RoomUpdate {
                            room_id,
                            change: RoomChange::RoomClosed,
                            user_id: Some(user_id),
                        },
                    )
                    .await;
            }
            info!(user_id, room_id, "host left; room disbanded");
        } else {
            let members: Vec<u64> = room
                .members
                .iter()
                .copied()
                .filter(|&m| m != user_id)
                .collect();
            self.shared
                .persist
                .update_room(
                    room_id,
                    RoomPatch {
                        members: Some(members),
                        ..RoomPatch::default()
                    },
                )
                .await?;
            self.shared.registry.set_room(self.session_id, None).await;
            self.shared
                .registry
                .send_event_to_user(
                    room.host_user_id,
                    SessionEvent::RoomUpdate {
                        room_id,
                        change: RoomChange::UserLeft,
                        user_id: Some(user_id),
                    },
                )
                .await;
            info!(user_id, room_id, "left room");
        }
        Ok(())
    }

    async fn invite(&self, room_id: u64, invitee: u64) -> HandlerResult {
        let (user_id, user_name) = self.require_user().await?;

        let _guard = self.shared.room_ops.lock().await;
        let room = self.shared.persist.get_room(room_id).await?;
        if room.host_user_id != user_id {
            return Err(ServiceError::permission_denied("only the host may invite"));
        }
        if room.status != RoomStatus::Idle {
            return Err(ServiceError::invalid_state("room is in a match"));
        }
        if room.members.contains(&invitee) {
            return Err(ServiceError::conflict("user is already a member"));
        }

        let mut invite_list = room.invite_list.clone();
        if !invite_list.contains(&invitee) {
            invite_list.push(invitee);
        }
        let updated = self
            .shared
            .persist
            .update_room(
                room_id,
                RoomPatch {
                    invite_list: Some(invite_list),
                    ..RoomPatch::default()
                },
            )
            .await?;

        let delivered = self
            .shared
            .registry
            .send_event_to_user(
                invitee,
                SessionEvent::Invited {
                    room_id,
                    room_name: room.name.clone(),
                    from_user_id: user_id,
                    from_user_name: user_name,
                },
            )
            .await;
        info!(user_id, room_id, invitee, delivered, "invite sent");
        Ok(("invited", json!(updated)))
    }

    async fn start_game(&self, room_id: u64) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;

        let _guard = self.shared.room_ops.lock().await;
        let room = self.shared.persist.get_room(room_id).await?;
        if room.host_user_id != user_id {
            return Err(ServiceError::permission_denied(
                "only the host may start the match",
            ));
        }
        if room.status != RoomStatus::Idle {
            return Err(ServiceError::invalid_state("room is already playing"));
        }
        if room.members.len() != 2 {
            return Err(ServiceError::invalid_state(
                "the room needs exactly two players",
            ));
        }

        let host_id = room.members[0];
        let guest_id = room.members[1];
        let launched = self
            .shared
            .launcher
            .launch(room_id, host_id, guest_id)
            .await
            .map_err(|e| {
                warn!(room_id, "start failed: {e}");
                ServiceError::new(ErrorKind::LauncherError, format!("start failed: {e}"))
            })?;

        if let Err(e) = self
            .shared
            .persist
            .update_room(
                room_id,
                RoomPatch {
                    status: Some(RoomStatus::Playing),
                    ..RoomPatch::default()
                },
            )
            .await
        {
            // Unwind: the room never left idle in the store.
            self.shared.launcher.abort(room_id).await;
            return Err(ServiceError::new(
                ErrorKind::LauncherError,
                format!("start failed: {e}"),
            ));
        }

        self.shared
            .registry
            .send_event_to_user(
                guest_id,
                SessionEvent::MatchReady {
                    host: self.shared.advertise_host.clone(),
                    port: launched.port,
                    match_id: launched.match_id.clone(),
                    role: Role::P2,
                },
            )
            .await;
        info!(
            room_id,
            port = launched.port,
            match_id = %launched.match_id,
            "match started"
        );

        Ok((
            "match started",
            json!({
                "host": self.shared.advertise_host,
                "port": launched.port,
                "match_id": launched.match_id,
                "role": Role::P1,
            }),
        ))
    }

    async fn kick(&self, room_id: u64, target: u64) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;

        let _guard = self.shared.room_ops.lock().await;
        let room = self.shared.persist.get_room(room_id).await?;
        if room.host_user_id != user_id {
            return Err(ServiceError::permission_denied("only the host may kick"));
        }
        if room.status != RoomStatus::Idle {
            return Err(ServiceError::invalid_state("room is in a match"));
        }
        if target == room.host_user_id {
            return Err(ServiceError::invalid_state("the host cannot be kicked"));
        }
        if !room.members.contains(&target) {
            return Err(ServiceError::not_found("user is not in the room"));
        }

        let members: Vec<u64> = room
            .members
            .iter()
            .copied()
            .filter(|&m| m != target)
            .collect();
        let updated = self
            .shared
            .persist
            .update_room(
                room_id,
                RoomPatch {
                    members: Some(members),
                    ..RoomPatch::default()
                },
            )
            .await?;
        self.shared.registry.set_room_for_user(target, None).await;
        self.shared
            .registry
            .send_event_to_user(
                target,
                SessionEvent::RoomUpdate {
                    room_id,
                    change: RoomChange::UserKicked,
                    user_id: Some(target),
                },
            )
            .await;
        info!(user_id, room_id, target, "kicked");
        Ok(("kicked", json!(updated)))
    }

    async fn match_history(&self) -> HandlerResult {
        let (user_id, _) = self.require_user().await?;
        let logs = self.shared.persist.list_game_logs(Some(user_id)).await?;
        Ok(("ok", json!(logs)))
    }

    /// Control-channel report from a match server: persist the log and
    /// return the room to idle.
    async fn report_match_result(
        &self,
        match_id: String,
        room_id: u64,
        winner: Option<u64>,
        results: Vec<PlayerResult>,
        start_at: String,
        end_at: String,
    ) -> HandlerResult {
        let users: Vec<u64> = results.iter().map(|r| r.user_id).collect();
        let log = self
            .shared
            .persist
            .create_game_log(match_id.clone(), room_id, users.clone(), start_at, end_at, results)
            .await?;

        match self
            .shared
            .persist
            .update_room(
                room_id,
                RoomPatch {
                    status: Some(RoomStatus::Idle),
                    ..RoomPatch::default()
                },
            )
            .await
        {
            Ok(_) => info!(room_id, match_id = %match_id, ?winner, "room back to idle"),
            Err(e) if e.kind == ErrorKind::NotFound => {
                // Both players disconnected mid-match and the room disbanded.
                warn!(room_id, "match ended for an already-deleted room");
            }
            Err(e) => return Err(e),
        }

        for user in users {
            self.shared
                .registry
                .send_event_to_user(
                    user,
                    SessionEvent::RoomUpdate {
                        room_id,
                        change: RoomChange::MatchEnded,
                        user_id: winner,
                    },
                )
                .await;
        }
        Ok(("result recorded", json!(log)))
    }
}
