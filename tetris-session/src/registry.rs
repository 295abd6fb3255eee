//! In-memory session registry.
//!
//! One mutex owns every session, the user-id index, and nothing else; room
//! state lives in the persistence service. Each session carries an unbounded
//! outbound channel so event pushes to a peer never block the pushing
//! request on a slow socket.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use tetris_types::{Response, ServiceError, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames queued for a session's writer task.
#[derive(Debug)]
pub enum Outbound {
    Response(Response),
    Event(SessionEvent),
}

#[derive(Debug)]
struct Session {
    user_id: Option<u64>,
    user_name: Option<String>,
    room_id: Option<u64>,
    sender: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    user_index: HashMap<u64, SessionId>,
}

pub struct Registry {
    inner: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState::default()),
        }
    }

    pub async fn create_session(&self, id: SessionId) -> mpsc::UnboundedReceiver<Outbound> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.inner.lock().await;
        state.sessions.insert(
            id,
            Session {
                user_id: None,
                user_name: None,
                room_id: None,
                sender,
            },
        );
        receiver
    }

    pub async fn remove_session(&self, id: SessionId) {
        let mut state = self.inner.lock().await;
        if let Some(session) = state.sessions.remove(&id) {
            if let Some(user_id) = session.user_id {
                state.user_index.remove(&user_id);
            }
        }
    }

    /// Bind an authenticated user to this session. A user id has at most one
    /// active session.
    pub async fn bind_user(
        &self,
        id: SessionId,
        user_id: u64,
        user_name: String,
    ) -> Result<(), ServiceError> {
        let mut state = self.inner.lock().await;
        if state.user_index.contains_key(&user_id) {
            return Err(ServiceError::conflict("user already has an active session"));
        }
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| ServiceError::not_found("session is gone"))?;
        session.user_id = Some(user_id);
        session.user_name = Some(user_name);
        state.user_index.insert(user_id, id);
        Ok(())
    }

    pub async fn unbind_user(&self, id: SessionId) {
        let mut state = self.inner.lock().await;
        if let Some(session) = state.sessions.get_mut(&id) {
            let removed_user_id = session.user_id.take();
            session.user_name = None;
            session.room_id = None;
            if let Some(user_id) = removed_user_id {
                state.user_index.remove(&user_id);
            }
        }
    }

    pub async fn session_user(&self, id: SessionId) -> Option<(u64, String)> {
        let state = self.inner.lock().await;
        let session = state.sessions.get(&id)?;
        Some((session.user_id?, session.user_name.clone()?))
    }

    pub async fn session_room(&self, id: SessionId) -> Option<u64> {
        let state = self.inner.lock().await;
        state.sessions.get(&id)?.room_id
    }

    pub async fn set_room(&self, id: SessionId, room_id: Option<u64>) {
        let mut state = self.inner.lock().await;
        if let Some(session) = state.sessions.get_mut(&id) {
            session.room_id = room_id;
        }
    }

    pub async fn set_room_for_user(&self, user_id: u64, room_id: Option<u64>) {
        let mut state = self.inner.lock().await;
        if let Some(id) = state.user_index.get(&user_id).copied() {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.room_id = room_id;
            }
        }
    }

    pub async fn is_online(&self, user_id: u64) -> bool {
        let state = self.inner.lock().await;
        state.user_index.contains_key(&user_id)
    }

    pub async fn online_users(&self) -> Vec<(u64, String)> {
        let state = self.inner.lock().await;
        state
            .sessions
            .values()
            .filter_map(|s| Some((s.user_id?, s.user_name.clone()?)))
            .collect()
    }

    /// Queue a response on the session's writer. Returns false when the
    /// session (or its socket) is gone.
    pub async fn send_response(&self, id: SessionId, response: Response) -> bool {
        let state = self.inner.lock().await;
        match state.sessions.get(&id) {
            Some(session) => session.sender.send(Outbound::Response(response)).is_ok(),
            None => false,
        }
    }

    /// Best-effort event push to a user's session, if any.
    pub async fn send_event_to_user(&self, user_id: u64, event: SessionEvent) -> bool {
        let state = self.inner.lock().await;
        let Some(id) = state.user_index.get(&user_id) else {
            return false;
        };
        match state.sessions.get(id) {
            Some(session) => session.sender.send(Outbound::Event(event)).is_ok(),
            None => false,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetris_types::{RoomChange, SessionEvent};

    #[tokio::test]
    async fn one_session_per_user() {
        let registry = Registry::new();
        let a = SessionId::new();
        let b = SessionId::new();
        let _rx_a = registry.create_session(a).await;
        let _rx_b = registry.create_session(b).await;

        registry.bind_user(a, 1, "Alice".to_string()).await.unwrap();
        let err = registry
            .bind_user(b, 1, "Alice".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind, tetris_types::ErrorKind::Conflict);

        registry.remove_session(a).await;
        // Slot frees up once the first session is gone.
        registry.bind_user(b, 1, "Alice".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn events_reach_the_bound_user() {
        let registry = Registry::new();
        let id = SessionId::new();
        let mut rx = registry.create_session(id).await;
        registry.bind_user(id, 5, "Eve".to_string()).await.unwrap();

        let delivered = registry
            .send_event_to_user(
                5,
                SessionEvent::RoomUpdate {
                    room_id: 1,
                    change: RoomChange::UserJoined,
                    user_id: Some(9),
                },
            )
            .await;
        assert!(delivered);
        assert!(matches!(rx.recv().await, Some(Outbound::Event(_))));

        assert!(!registry.send_event_to_user(99, SessionEvent::RoomUpdate {
            room_id: 1,
            change: RoomChange::UserLeft,
            user_id: None,
        })
        .await);
    }

    #[tokio::test]
    async fn logout_clears_user_and_room() {
        let registry = Registry::new();
        let id = SessionId::new();
        let _rx = registry.create_session(id).await;
        registry.bind_user(id, 2, "Bob".to_string()).await.unwrap();
        registry.set_room(id, Some(7)).await;

        registry.unbind_user(id).await;
        assert!(registry.session_user(id).await.is_none());
        assert!(registry.session_room(id).await.is_none());
        assert!(!registry.is_online(2).await);
    }
}
