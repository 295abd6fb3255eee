//! Full-stack flows: persistence service + session service in-process, with
//! real match-server child processes spawned by the launcher.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use tetris_persistence::{service as persist_service, PersistClient, Storage};
use tetris_session::{connection, LauncherConfig, MatchLauncher, Registry, SessionShared};
use tetris_types::framing::{read_frame, write_frame};
use tetris_types::{
    MatchMessage, Response, Role, RoomStatus, SessionEvent, SessionRequest, Visibility,
};

async fn start_stack() -> SocketAddr {
    let persist_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let persist_addr = persist_listener.local_addr().unwrap();
    tokio::spawn(persist_service::run(
        persist_listener,
        Arc::new(Storage::in_memory()),
    ));

    let session_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let session_addr = session_listener.local_addr().unwrap();
    let launcher = MatchLauncher::new(LauncherConfig {
        match_bin: PathBuf::from(env!("CARGO_BIN_EXE_tetris-match")),
        port_base: 10150,
        port_span: 40,
        session_addr: session_addr.to_string(),
        max_match_duration: Duration::from_secs(120),
    });
    let shared = Arc::new(SessionShared::new(
        Registry::new(),
        PersistClient::new(persist_addr.to_string()),
        launcher,
        "127.0.0.1".to_string(),
    ));
    tokio::spawn(connection::serve(session_listener, shared));
    session_addr
}

/// Framed client for the session service; stashes event pushes that arrive
/// while waiting for a response.
struct Client {
    stream: TcpStream,
    events: VecDeque<SessionEvent>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            events: VecDeque::new(),
        }
    }

    async fn request(&mut self, request: &SessionRequest) -> Response {
        write_frame(&mut self.stream, request).await.unwrap();
        loop {
            let value: Value = timeout(Duration::from_secs(10), read_frame(&mut self.stream))
                .await
                .expect("response in time")
                .unwrap();
            if value.get("status").is_some() {
                return serde_json::from_value(value).unwrap();
            }
            self.events
                .push_back(serde_json::from_value(value).unwrap());
        }
    }

    async fn next_event(&mut self) -> SessionEvent {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        let value: Value = timeout(Duration::from_secs(10), read_frame(&mut self.stream))
            .await
            .expect("event in time")
            .unwrap();
        serde_json::from_value(value).unwrap()
    }

    async fn login_fresh(addr: SocketAddr, name: &str, email: &str, password: &str) -> (Self, u64) {
        let mut client = Self::connect(addr).await;
        client
            .request(&SessionRequest::Register {
                name: name.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })
            .await
            .into_result::<Value>()
            .unwrap();
        let data: Value = client
            .request(&SessionRequest::Login {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await
            .into_result()
            .unwrap();
        (client, data["user_id"].as_u64().unwrap())
    }
}

async fn hello(addr: SocketAddr, room_id: u64, user_id: u64) -> (TcpStream, u64, Role) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(
        &mut stream,
        &MatchMessage::Hello {
            version: 1,
            room_id,
            user_id,
        },
    )
    .await
    .unwrap();
    let welcome: MatchMessage = timeout(Duration::from_secs(10), read_frame(&mut stream))
        .await
        .expect("welcome in time")
        .unwrap();
    match welcome {
        MatchMessage::Welcome { role, seed, .. } => (stream, seed, role),
        other => panic!("expected WELCOME, got {other:?}"),
    }
}

#[tokio::test]
async fn full_flow_from_register_to_forfeit_and_log() {
    let session_addr = start_stack().await;

    // Register and log in both players.
    let (mut alice, alice_id) = Client::login_fresh(session_addr, "Alice", "alice@x", "A").await;
    let (mut bob, bob_id) = Client::login_fresh(session_addr, "Bob", "bob@x", "B").await;

    // Alice opens a public room; Bob finds and joins it.
    let room: Value = alice
        .request(&SessionRequest::CreateRoom {
            name: "R".to_string(),
            visibility: Visibility::Public,
        })
        .await
        .into_result()
        .unwrap();
    let room_id = room["id"].as_u64().unwrap();

    let rooms: Vec<Value> = bob
        .request(&SessionRequest::ListRooms)
        .await
        .into_result()
        .unwrap();
    assert!(rooms.iter().any(|r| r["name"] == "R"));

    bob.request(&SessionRequest::JoinRoom { room_id })
        .await
        .into_result::<Value>()
        .unwrap();

    // Alice starts; she gets the endpoint directly, Bob via match_ready.
    let start: Value = alice
        .request(&SessionRequest::StartGame { room_id })
        .await
        .into_result()
        .unwrap();
    assert_eq!(start["role"], "P1");
    let port = start["port"].as_u64().unwrap() as u16;
    let match_id = start["match_id"].as_str().unwrap().to_string();

    let event = bob.next_event().await;
    let SessionEvent::MatchReady {
        host,
        port: event_port,
        match_id: event_match_id,
        role,
    } = event
    else {
        panic!("expected match_ready, got {event:?}");
    };
    assert_eq!(role, Role::P2);
    assert_eq!(event_port, port);
    assert_eq!(event_match_id, match_id);

    // Both complete the match handshake and share one seed.
    let match_addr: SocketAddr = format!("{host}:{port}").parse().unwrap();
    let (mut alice_match, seed_a, role_a) = hello(match_addr, room_id, alice_id).await;
    let (bob_match, seed_b, role_b) = hello(match_addr, room_id, bob_id).await;
    assert_eq!(role_a, Role::P1);
    assert_eq!(role_b, Role::P2);
    assert_eq!(seed_a, seed_b);

    // Bob vanishes mid-match: Alice wins by forfeit.
    drop(bob_match);
    let winner = loop {
        let frame: MatchMessage =
            timeout(Duration::from_secs(10), read_frame(&mut alice_match))
                .await
                .expect("frame in time")
                .unwrap();
        if let MatchMessage::GameOver { winner, .. } = frame {
            break winner;
        }
    };
    assert_eq!(winner, Some(alice_id));

    // The session service records the log and puts the room back to idle.
    let mut logged = None;
    for _ in 0..50 {
        let logs: Vec<Value> = alice
            .request(&SessionRequest::MatchHistory)
            .await
            .into_result()
            .unwrap();
        if !logs.is_empty() {
            logged = Some(logs);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let logs = logged.expect("a match log shows up after the forfeit");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["match_id"], match_id.as_str());
    assert!(logs[0]["users"]
        .as_array()
        .unwrap()
        .iter()
        .any(|u| u.as_u64() == Some(bob_id)));
    assert!(!logs[0]["end_at"].as_str().unwrap().is_empty());

    let rooms: Vec<tetris_types::Room> = alice
        .request(&SessionRequest::ListRooms)
        .await
        .into_result()
        .unwrap();
    let room = rooms.iter().find(|r| r.id == room_id).unwrap();
    assert_eq!(room.status, RoomStatus::Idle);
}
