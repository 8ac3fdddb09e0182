//! Persistence integration tests.
//!
//! Validates:
//! - Sessions, roles and membership survive a restart
//! - Operation sequences continue where the log left off
//! - Replay after restart returns the exact recorded operations
//! - Presence records are restored from storage
//! - Server construction with a storage path

use canopy_collab::config::{CollabConfig, ServerConfig};
use canopy_collab::coordinator::SessionCoordinator;
use canopy_collab::model::{DocumentType, OperationDraft, PresenceUpdate, Role, Vec2, VectorClock};
use canopy_collab::server::CollabServer;
use canopy_collab::session::AllowAll;
use canopy_collab::storage::{CollabStore, RocksStore, StoreConfig};
use canopy_collab::LocalBus;
use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

fn open_coordinator(path: &Path) -> Arc<SessionCoordinator> {
    let store = RocksStore::open(StoreConfig::for_testing(path)).unwrap();
    let config = CollabConfig::for_testing();
    Arc::new(SessionCoordinator::new(
        Arc::new(store),
        Arc::new(LocalBus::new(config.broadcast_capacity)),
        Arc::new(AllowAll),
        config,
    ))
}

#[tokio::test]
async fn test_sessions_and_roles_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Uuid::new_v4();
    let editor = Uuid::new_v4();

    let session_id = {
        let coord = open_coordinator(dir.path());
        let session = coord
            .create_session("Quarterly plan", DocumentType::Strategy, owner)
            .await
            .unwrap();
        coord.sessions().join_session(session.id, editor).await.unwrap();
        coord.change_role(session.id, owner, editor, Role::Editor).await.unwrap();
        session.id
    };

    let coord = open_coordinator(dir.path());
    let session = coord.get_session(session_id).await.unwrap();
    assert_eq!(session.name, "Quarterly plan");
    assert_eq!(session.document_type, DocumentType::Strategy);
    assert!(session.is_active);

    let participants = coord.list_participants(session_id).await.unwrap();
    assert_eq!(participants.len(), 2);
    let role_of = |user| participants.iter().find(|p| p.user_id == user).unwrap().role;
    assert_eq!(role_of(owner), Role::Owner);
    assert_eq!(role_of(editor), Role::Editor);

    let sessions = coord.list_user_sessions(editor).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, session_id);
}

#[tokio::test]
async fn test_sequence_continues_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Uuid::new_v4();

    let (session_id, recorded) = {
        let coord = open_coordinator(dir.path());
        let session = coord
            .create_session("Map", DocumentType::Mindmap, owner)
            .await
            .unwrap();
        let conn = coord.connect(session.id, owner);
        conn.join(None).await.unwrap();

        let mut recorded = Vec::new();
        for i in 0..10u8 {
            let mut clock = VectorClock::new();
            clock.tick(owner);
            let op = conn
                .send_operation(OperationDraft::new("add_node", vec![i; 64]).with_clock(clock))
                .await
                .unwrap();
            recorded.push(op);
        }
        (session.id, recorded)
    };

    let coord = open_coordinator(dir.path());
    assert_eq!(coord.log().tail(session_id).await.unwrap(), 10);

    let conn = coord.connect(session_id, owner);
    conn.join(None).await.unwrap();
    let next = conn
        .send_operation(OperationDraft::new("add_edge", vec![0xAB]))
        .await
        .unwrap();
    assert_eq!(next.sequence, 11);

    let replayed: Vec<_> = coord
        .log()
        .replay_since(session_id, 0)
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(replayed.len(), 11);
    assert_eq!(&replayed[..10], &recorded[..]);
    assert_eq!(replayed[10].id, next.id);
}

#[tokio::test]
async fn test_applied_flag_persists() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Uuid::new_v4();

    let session_id = {
        let coord = open_coordinator(dir.path());
        let session = coord
            .create_session("Board", DocumentType::Whiteboard, owner)
            .await
            .unwrap();
        let conn = coord.connect(session.id, owner);
        conn.join(None).await.unwrap();
        for _ in 0..3 {
            conn.send_operation(OperationDraft::new("draw_stroke", vec![1, 2, 3]))
                .await
                .unwrap();
        }
        conn.acknowledge_applied(2).await.unwrap();
        session.id
    };

    let coord = open_coordinator(dir.path());
    let ops = coord.operations_since(session_id, 0).await.unwrap();
    assert_eq!(
        ops.iter().map(|op| op.applied).collect::<Vec<_>>(),
        vec![false, true, false]
    );
}

#[tokio::test]
async fn test_presence_restored_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Uuid::new_v4();

    let session_id = {
        let coord = open_coordinator(dir.path());
        let session = coord
            .create_session("Slides", DocumentType::Presentation, owner)
            .await
            .unwrap();
        let conn = coord.connect(session.id, owner);
        conn.join(None).await.unwrap();
        conn.heartbeat(
            PresenceUpdate::online()
                .with_cursor(Vec2::new(120.0, 48.5))
                .with_selection(vec!["slide-2".into()]),
        )
        .unwrap();
        session.id
    };

    let coord = open_coordinator(dir.path());
    let snapshot = coord.presence_snapshot(session_id);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].user_id, owner);
    assert_eq!(snapshot[0].cursor, Some(Vec2::new(120.0, 48.5)));
    assert_eq!(snapshot[0].selection, vec!["slide-2".to_string()]);
}

#[tokio::test]
async fn test_deactivated_session_stays_closed() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Uuid::new_v4();

    let session_id = {
        let coord = open_coordinator(dir.path());
        let session = coord
            .create_session("Archived", DocumentType::Mindmap, owner)
            .await
            .unwrap();
        coord.deactivate_session(session.id, owner).await.unwrap();
        session.id
    };

    let coord = open_coordinator(dir.path());
    assert!(!coord.get_session(session_id).await.unwrap().is_active);
    assert!(coord.list_user_sessions(owner).await.unwrap().is_empty());
    assert!(coord.connect(session_id, Uuid::new_v4()).join(None).await.is_err());
}

#[test]
fn test_store_isolates_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    assert_eq!(store.last_sequence(Uuid::new_v4()).unwrap(), 0);
    assert!(store.operations_after(Uuid::new_v4(), 0, 10).unwrap().is_empty());
    assert!(store.list_presence(Uuid::new_v4()).unwrap().is_empty());
}

#[tokio::test]
async fn test_server_persistence_config() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Uuid::new_v4();
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        storage_path: Some(dir.path().join("server-db")),
        ..ServerConfig::default()
    };

    let session_id = {
        let server = CollabServer::new(config.clone()).unwrap();
        server
            .coordinator()
            .create_session("Served", DocumentType::Whiteboard, owner)
            .await
            .unwrap()
            .id
    };

    let server = CollabServer::new(config).unwrap();
    let session = server.coordinator().get_session(session_id).await.unwrap();
    assert_eq!(session.owner_id, owner);
}

#[tokio::test]
async fn test_server_in_memory_mode_no_store() {
    let server = CollabServer::new(ServerConfig::default()).unwrap();
    let result = server.coordinator().get_session(Uuid::new_v4()).await;
    assert!(result.is_err());
}
