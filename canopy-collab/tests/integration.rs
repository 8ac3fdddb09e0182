//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full pipeline from socket to operation log and back.

use canopy_collab::client::{ClientEvent, ClientState, SyncClient};
use canopy_collab::config::ServerConfig;
use canopy_collab::coordinator::SessionCoordinator;
use canopy_collab::error::{CollabError, ErrorKind};
use canopy_collab::model::{DocumentType, PresenceUpdate, Role, SessionId, UserId, Vec2};
use canopy_collab::protocol::{ClientMessage, ServerMessage};
use canopy_collab::server::CollabServer;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

struct TestServer {
    url: String,
    server: Arc<CollabServer>,
}

impl TestServer {
    fn coordinator(&self) -> &Arc<SessionCoordinator> {
        self.server.coordinator()
    }

    async fn create_session(&self, owner: UserId) -> SessionId {
        self.coordinator()
            .create_session("Brainstorm", DocumentType::Mindmap, owner)
            .await
            .unwrap()
            .id
    }
}

/// Start a server on a free port.
async fn start_test_server() -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        heartbeat_interval_secs: 30,
        ..ServerConfig::default()
    };
    let coordinator = SessionCoordinator::in_memory(config.collab.clone());
    let server = Arc::new(CollabServer::with_coordinator(config, Arc::new(coordinator)));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        server,
    }
}

/// Connect and join, draining the Joined event.
async fn join(url: &str, session_id: SessionId, user_id: UserId) -> (SyncClient, Receiver<ClientEvent>) {
    let mut client = SyncClient::new(session_id, user_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Some(ClientEvent::Joined { .. })) => {}
        other => panic!("Expected Joined event, got {other:?}"),
    }
    (client, events)
}

/// Wait for the first event `pick` accepts, skipping the rest.
async fn wait_for<T>(events: &mut Receiver<ClientEvent>, mut pick: impl FnMut(ClientEvent) -> Option<T>) -> T {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(event)) => {
                if let Some(found) = pick(event) {
                    return found;
                }
            }
            other => panic!("Event not received: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&server.url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_session() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let session_id = server.create_session(owner).await;

    let mut client = SyncClient::new(session_id, owner, &server.url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Some(ClientEvent::Joined {
            session,
            role,
            participants,
            tail,
            ..
        })) => {
            assert_eq!(session.id, session_id);
            assert_eq!(role, Role::Owner);
            assert_eq!(participants.len(), 1);
            assert_eq!(tail, 0);
        }
        other => panic!("Expected Joined event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ClientState::Connected);
}

#[tokio::test]
async fn test_join_unknown_session_is_rejected() {
    let server = start_test_server().await;
    let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), &server.url);
    let result = client.connect().await;
    assert!(matches!(result, Err(CollabError::NotFound(_))));
    assert_eq!(client.connection_state().await, ClientState::Disconnected);
}

#[tokio::test]
async fn test_operation_flows_between_clients() {
    let server = start_test_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let session_id = server.create_session(alice).await;

    let (client_a, mut events_a) = join(&server.url, session_id, alice).await;
    let (client_b, mut events_b) = join(&server.url, session_id, bob).await;

    let request = client_a.change_role(bob, Role::Editor).await.unwrap();
    wait_for(&mut events_a, |e| match e {
        ClientEvent::RoleChangeAccepted { request_id } if request_id == request => Some(()),
        _ => None,
    })
    .await;
    let promoted = wait_for(&mut events_b, |e| match e {
        ClientEvent::RoleChanged(p) if p.user_id == bob => Some(p),
        _ => None,
    })
    .await;
    assert_eq!(promoted.role, Role::Editor);

    let ticket = client_b
        .submit_operation("add_node", br#"{"label":"Idea"}"#.to_vec())
        .await
        .unwrap();
    assert!(!ticket.queued);

    let sequence = wait_for(&mut events_b, |e| match e {
        ClientEvent::OperationAcked { request_id, sequence } if request_id == ticket.request_id => {
            Some(sequence)
        }
        _ => None,
    })
    .await;
    assert_eq!(sequence, 1);

    let op = wait_for(&mut events_a, |e| match e {
        ClientEvent::Operation(op) => Some(op),
        _ => None,
    })
    .await;
    assert_eq!(op.id, ticket.operation_id);
    assert_eq!(op.author_id, bob);
    assert_eq!(op.sequence, 1);
    assert_eq!(op.payload, br#"{"label":"Idea"}"#.to_vec());

    // Receiving merges the author's clock
    assert_eq!(client_a.clock().await.get(&bob), 1);
    assert_eq!(client_a.last_sequence().await, 1);
}

#[tokio::test]
async fn test_viewer_submission_is_denied() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let viewer = Uuid::new_v4();
    let session_id = server.create_session(owner).await;

    let (client, mut events) = join(&server.url, session_id, viewer).await;
    let ticket = client.submit_operation("draw_stroke", vec![1, 2, 3]).await.unwrap();

    let error = wait_for(&mut events, |e| match e {
        ClientEvent::Error { request_id, error } if request_id == Some(ticket.request_id) => Some(error),
        _ => None,
    })
    .await;
    assert!(matches!(error, CollabError::PermissionDenied(_)));
    assert_eq!(server.coordinator().log().tail(session_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_first_frame_must_be_join() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();

    let heartbeat = ClientMessage::heartbeat(&PresenceUpdate::online(), 1).encode().unwrap();
    ws.send(Message::Binary(heartbeat.into())).await.unwrap();

    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => {
                match ServerMessage::decode(&data).unwrap() {
                    ServerMessage::Error { kind, .. } => {
                        assert_eq!(kind, ErrorKind::InvalidOperation);
                        break;
                    }
                    other => panic!("Expected Error, got {other:?}"),
                }
            }
            Ok(Some(Ok(_))) => continue,
            other => panic!("Expected a reply, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_offline_queue_flushes_after_join() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let session_id = server.create_session(owner).await;

    let mut client = SyncClient::new(session_id, owner, &server.url);
    let mut events = client.take_event_rx().unwrap();

    let mut tickets = Vec::new();
    for i in 0..5u8 {
        let ticket = client.submit_operation("add_node", vec![i; 16]).await.unwrap();
        assert!(ticket.queued);
        tickets.push(ticket);
    }
    assert_eq!(client.offline_queue_len().await, 5);

    client.connect().await.unwrap();
    assert_eq!(client.offline_queue_len().await, 0);

    let mut acked = Vec::new();
    while acked.len() < 5 {
        let (request_id, sequence) = wait_for(&mut events, |e| match e {
            ClientEvent::OperationAcked { request_id, sequence } => Some((request_id, sequence)),
            _ => None,
        })
        .await;
        acked.push((request_id, sequence));
    }
    let expected: Vec<(u64, u64)> = tickets
        .iter()
        .zip(1..)
        .map(|(t, seq)| (t.request_id, seq))
        .collect();
    assert_eq!(acked, expected);

    // Client-generated ids are kept by the log
    let log = server.coordinator().operations_since(session_id, 0).await.unwrap();
    assert_eq!(log[0].id, tickets[0].operation_id);
}

#[tokio::test]
async fn test_cursor_presence_reaches_other_clients() {
    let server = start_test_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let session_id = server.create_session(alice).await;

    let (client_a, _events_a) = join(&server.url, session_id, alice).await;
    let (_client_b, mut events_b) = join(&server.url, session_id, bob).await;

    let sent = client_a
        .update_presence(
            PresenceUpdate::online()
                .with_cursor(Vec2::new(150.0, 250.0))
                .with_selection(vec!["node-1".into()]),
        )
        .await
        .unwrap();
    assert!(sent);

    let record = wait_for(&mut events_b, |e| match e {
        ClientEvent::Presence(r) if r.user_id == alice && r.cursor.is_some() => Some(r),
        _ => None,
    })
    .await;
    assert_eq!(record.cursor, Some(Vec2::new(150.0, 250.0)));
    assert_eq!(record.selection, vec!["node-1".to_string()]);

    // A burst inside the throttle window is dropped
    let burst = client_a
        .update_presence(PresenceUpdate::online().with_cursor(Vec2::new(151.0, 250.0)))
        .await
        .unwrap();
    assert!(!burst);
}

#[tokio::test]
async fn test_reconnect_catches_up() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let reader = Uuid::new_v4();
    let session_id = server.create_session(owner).await;

    let (client_a, _events_a) = join(&server.url, session_id, owner).await;
    let (mut client_b, mut events_b) = join(&server.url, session_id, reader).await;

    client_a.submit_operation("draw_stroke", vec![1]).await.unwrap();
    wait_for(&mut events_b, |e| match e {
        ClientEvent::Operation(op) => Some(op),
        _ => None,
    })
    .await;

    client_b.leave().await.unwrap();
    wait_for(&mut events_b, |e| matches!(e, ClientEvent::Disconnected).then_some(())).await;

    for i in 2..=4u8 {
        client_a.submit_operation("draw_stroke", vec![i]).await.unwrap();
    }
    // Let the appends land before rejoining
    while server.coordinator().log().tail(session_id).await.unwrap() < 4 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client_b.connect().await.unwrap();
    let mut sequences = Vec::new();
    while sequences.len() < 3 {
        let op = wait_for(&mut events_b, |e| match e {
            ClientEvent::Operation(op) => Some(op),
            _ => None,
        })
        .await;
        sequences.push(op.sequence);
    }
    assert_eq!(sequences, vec![2, 3, 4]);
    assert_eq!(client_b.last_sequence().await, 4);
}

#[tokio::test]
async fn test_ping_pong() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let session_id = server.create_session(owner).await;

    let (client, mut events) = join(&server.url, session_id, owner).await;
    client.send_ping().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Pong).then_some(())).await;
}

#[tokio::test]
async fn test_server_stats_track_traffic() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let session_id = server.create_session(owner).await;

    let (client, mut events) = join(&server.url, session_id, owner).await;
    client.submit_operation("add_node", vec![0; 8]).await.unwrap();
    wait_for(&mut events, |e| match e {
        ClientEvent::OperationAcked { .. } => Some(()),
        _ => None,
    })
    .await;

    let stats = server.server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.joins, 1);
    assert_eq!(stats.operations_appended, 1);
    assert!(stats.total_messages >= 2);
    assert!(stats.total_bytes > 0);
}
