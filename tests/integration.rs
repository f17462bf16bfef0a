//! End-to-end tests for the edit pipeline.
//!
//! Each test starts a real server on a free port and drives real WebSocket
//! clients through authentication, room join, and the OT edit path,
//! asserting canonical store content and per-peer fanout.

use std::sync::Arc;

use tandem_collab::auth::{Identity, StaticVerifier};
use tandem_collab::client::{CollabClient, SessionEvent};
use tandem_collab::config::Config;
use tandem_collab::ephemeral::MemoryEphemeralStore;
use tandem_collab::protocol::ServerFrame;
use tandem_collab::server::CollabServer;
use tandem_collab::store::memory::{seed_room_with_member, MemoryStore};
use tandem_collab::store::DocumentStore;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

struct TestEnv {
    url: String,
    store: Arc<MemoryStore>,
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with a static token per (token, identity) pair.
async fn start_test_server(tokens: &[(&str, Identity)]) -> TestEnv {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let ephemeral = Arc::new(MemoryEphemeralStore::new());
    let mut verifier = StaticVerifier::new();
    for (token, identity) in tokens {
        verifier = verifier.with_token(*token, identity.clone());
    }
    let config = Config {
        listen_addr: format!("127.0.0.1:{port}"),
        ..Config::default()
    };
    let server = CollabServer::new(config, store.clone(), ephemeral, Arc::new(verifier));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestEnv {
        url: format!("ws://127.0.0.1:{port}"),
        store,
    }
}

fn identity(username: &str) -> Identity {
    Identity {
        user_id: Uuid::new_v4(),
        username: username.to_string(),
    }
}

/// Connect, join, and drain the room-users/room-files snapshots.
async fn join_client(
    env: &TestEnv,
    token: &str,
    identity: &Identity,
    room_id: Uuid,
) -> (CollabClient, Receiver<SessionEvent>) {
    let mut client = CollabClient::new(identity.user_id);
    client.connect(&env.url, Some(token)).await.unwrap();
    let mut events = client.take_event_rx().unwrap();
    client.join_room(room_id, None).await.unwrap();
    wait_for(&mut events, |f| matches!(f, ServerFrame::RoomUsers { .. })).await;
    wait_for(&mut events, |f| matches!(f, ServerFrame::RoomFiles { .. })).await;
    (client, events)
}

/// Next protocol frame, skipping connection events.
async fn next_frame(events: &mut Receiver<SessionEvent>) -> ServerFrame {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("event channel closed");
        if let SessionEvent::Frame(frame) = event {
            return frame;
        }
    }
}

/// Skip frames until one matches.
async fn wait_for(
    events: &mut Receiver<SessionEvent>,
    pred: impl Fn(&ServerFrame) -> bool,
) -> ServerFrame {
    loop {
        let frame = next_frame(events).await;
        if pred(&frame) {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let env = start_test_server(&[]).await;
    let result = tokio_tungstenite::connect_async(&env.url).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_bad_token_closes_session() {
    let env = start_test_server(&[]).await;
    let mut client = CollabClient::new(Uuid::new_v4());
    client.connect(&env.url, Some("bogus")).await.unwrap();
    let mut events = client.take_event_rx().unwrap();

    // Error frame, then disconnect.
    let frame = next_frame(&mut events).await;
    match frame {
        ServerFrame::Error { code, .. } => assert_eq!(code, "unauthenticated"),
        other => panic!("expected error, got {other:?}"),
    }
    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert!(matches!(event, Some(SessionEvent::Disconnected)));
}

#[tokio::test]
async fn test_non_member_join_rejected_but_connected() {
    let alice = identity("alice");
    let env = start_test_server(&[("tok-alice", alice.clone())]).await;
    // Room exists but alice is not a member.
    let stranger_room = {
        let owner = Uuid::new_v4();
        seed_room_with_member(&env.store, owner, "owner").await
    };

    let mut client = CollabClient::new(alice.user_id);
    client.connect(&env.url, Some("tok-alice")).await.unwrap();
    let mut events = client.take_event_rx().unwrap();
    client.join_room(stranger_room, None).await.unwrap();

    match next_frame(&mut events).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, "forbidden"),
        other => panic!("expected error, got {other:?}"),
    }
    // Still connected: no Disconnected event arrives.
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
}

#[tokio::test]
async fn test_single_insert_reaches_store_and_every_peer_once() {
    // S1: empty file, X inserts "hello".
    let x = identity("x");
    let y = identity("y");
    let env = start_test_server(&[("tok-x", x.clone()), ("tok-y", y.clone())]).await;
    let room_id = seed_room_with_member(&env.store, x.user_id, "x").await;
    env.store.seed_user(y.user_id, "y").await;
    env.store.seed_member(room_id, y.user_id).await;
    let file = env.store.create_file(room_id, "main.rs", "rust").await.unwrap();

    let (cx, _ex) = join_client(&env, "tok-x", &x, room_id).await;
    let (cy, mut ey) = join_client(&env, "tok-y", &y, room_id).await;

    cx.send_insert(file.id, 0, "hello").await.unwrap();

    match wait_for(&mut ey, |f| matches!(f, ServerFrame::CodeUpdate { .. })).await {
        ServerFrame::CodeUpdate { file_id, op, user_id } => {
            assert_eq!(file_id, file.id);
            assert_eq!(user_id, x.user_id);
            assert_eq!(op.position(), 0);
        }
        _ => unreachable!(),
    }
    // Exactly once: nothing further arrives.
    assert!(timeout(Duration::from_millis(200), ey.recv()).await.is_err());

    assert_eq!(env.store.load_file(file.id).await.unwrap().content, "hello");
    assert_eq!(cx.document(file.id).await.unwrap(), "hello");
    assert_eq!(cy.document(file.id).await.unwrap(), "hello");
}

#[tokio::test]
async fn test_concurrent_inserts_same_position_converge() {
    // S2: content "ab"; A and B insert at 1 concurrently. The hub
    // linearizes them; an observer applying broadcasts in hub order ends
    // at the canonical content.
    let a = identity("a");
    let b = identity("b");
    let z = identity("z");
    let env = start_test_server(&[
        ("tok-a", a.clone()),
        ("tok-b", b.clone()),
        ("tok-z", z.clone()),
    ])
    .await;
    let room_id = seed_room_with_member(&env.store, a.user_id, "a").await;
    for (id, name) in [(b.user_id, "b"), (z.user_id, "z")] {
        env.store.seed_user(id, name).await;
        env.store.seed_member(room_id, id).await;
    }
    let file = env.store.create_file(room_id, "main.rs", "rust").await.unwrap();
    env.store.save_content(file.id, "ab").await.unwrap();

    let (ca, _ea) = join_client(&env, "tok-a", &a, room_id).await;
    let (cb, _eb) = join_client(&env, "tok-b", &b, room_id).await;
    let (cz, mut ez) = join_client(&env, "tok-z", &z, room_id).await;

    // Fire without sequencing: the hub decides arrival order.
    let (ra, rb) = tokio::join!(
        ca.send_insert(file.id, 1, "X"),
        cb.send_insert(file.id, 1, "Y"),
    );
    ra.unwrap();
    rb.unwrap();

    // Observer sees both updates in hub order.
    for _ in 0..2 {
        wait_for(&mut ez, |f| matches!(f, ServerFrame::CodeUpdate { .. })).await;
    }

    let stored = env.store.load_file(file.id).await.unwrap().content;
    assert_eq!(cz.document(file.id).await.unwrap(), stored);
    assert_eq!(stored.len(), 4);
    assert!(stored == "aXYb" || stored == "aYXb");
    assert!(stored.starts_with('a') && stored.ends_with('b'));
}

#[tokio::test]
async fn test_insert_vs_delete_overlap_transforms() {
    // S3: "abcdef"; A deletes "bcd", then B's stale insert at 3 is
    // transformed to position 1. Final content "aZef".
    let a = identity("a");
    let b = identity("b");
    let env = start_test_server(&[("tok-a", a.clone()), ("tok-b", b.clone())]).await;
    let room_id = seed_room_with_member(&env.store, a.user_id, "a").await;
    env.store.seed_user(b.user_id, "b").await;
    env.store.seed_member(room_id, b.user_id).await;
    let file = env.store.create_file(room_id, "main.rs", "rust").await.unwrap();
    env.store.save_content(file.id, "abcdef").await.unwrap();

    let (ca, mut ea) = join_client(&env, "tok-a", &a, room_id).await;
    let (cb, mut eb) = join_client(&env, "tok-b", &b, room_id).await;

    ca.send_delete(file.id, 1, 3).await.unwrap();
    // Ensure A's delete is processed first.
    wait_for(&mut eb, |f| matches!(f, ServerFrame::CodeUpdate { .. })).await;

    cb.send_insert(file.id, 3, "Z").await.unwrap();

    match wait_for(&mut ea, |f| matches!(f, ServerFrame::CodeUpdate { .. })).await {
        ServerFrame::CodeUpdate { op, user_id, .. } => {
            assert_eq!(user_id, b.user_id);
            assert_eq!(op.position(), 1, "insert collapsed into the deleted window");
        }
        _ => unreachable!(),
    }

    assert_eq!(env.store.load_file(file.id).await.unwrap().content, "aZef");
    assert_eq!(ca.document(file.id).await.unwrap(), "aZef");
}

#[tokio::test]
async fn test_sequential_edits_converge_everywhere() {
    let a = identity("a");
    let b = identity("b");
    let env = start_test_server(&[("tok-a", a.clone()), ("tok-b", b.clone())]).await;
    let room_id = seed_room_with_member(&env.store, a.user_id, "a").await;
    env.store.seed_user(b.user_id, "b").await;
    env.store.seed_member(room_id, b.user_id).await;
    let file = env.store.create_file(room_id, "main.rs", "rust").await.unwrap();

    let (ca, mut ea) = join_client(&env, "tok-a", &a, room_id).await;
    let (cb, mut eb) = join_client(&env, "tok-b", &b, room_id).await;

    ca.send_insert(file.id, 0, "fn main() {}").await.unwrap();
    wait_for(&mut eb, |f| matches!(f, ServerFrame::CodeUpdate { .. })).await;

    // B appends at the end of what it now sees.
    cb.send_insert(file.id, 12, " // entry").await.unwrap();
    wait_for(&mut ea, |f| matches!(f, ServerFrame::CodeUpdate { .. })).await;

    let stored = env.store.load_file(file.id).await.unwrap().content;
    assert_eq!(stored, "fn main() {} // entry");
    assert_eq!(ca.document(file.id).await.unwrap(), stored);
    assert_eq!(cb.document(file.id).await.unwrap(), stored);
}

#[tokio::test]
async fn test_chat_fanout_to_all_in_stamp_order() {
    let a = identity("a");
    let b = identity("b");
    let env = start_test_server(&[("tok-a", a.clone()), ("tok-b", b.clone())]).await;
    let room_id = seed_room_with_member(&env.store, a.user_id, "a").await;
    env.store.seed_user(b.user_id, "b").await;
    env.store.seed_member(room_id, b.user_id).await;

    let (ca, mut ea) = join_client(&env, "tok-a", &a, room_id).await;
    let (cb, mut eb) = join_client(&env, "tok-b", &b, room_id).await;

    ca.send_chat("first", None).await.unwrap();
    // Sequence the second message behind the first.
    wait_for(&mut eb, |f| matches!(f, ServerFrame::ChatMessage(_))).await;
    cb.send_chat("second", Some("let x = 1;")).await.unwrap();

    // The sender sees its own authoritative copy too.
    let mut a_seen = Vec::new();
    let frame = wait_for(&mut ea, |f| matches!(f, ServerFrame::ChatMessage(_))).await;
    if let ServerFrame::ChatMessage(entry) = frame {
        a_seen.push(entry);
    }
    let frame = wait_for(&mut ea, |f| matches!(f, ServerFrame::ChatMessage(_))).await;
    if let ServerFrame::ChatMessage(entry) = frame {
        a_seen.push(entry);
    }
    assert_eq!(a_seen[0].message, "first");
    assert_eq!(a_seen[0].username, "a");
    assert_eq!(a_seen[1].message, "second");
    assert_eq!(a_seen[1].code_snippet.as_deref(), Some("let x = 1;"));
    assert!(a_seen[0].timestamp <= a_seen[1].timestamp);

    // History replays the same two entries to the requester only.
    cb.get_chat_history().await.unwrap();
    match wait_for(&mut eb, |f| matches!(f, ServerFrame::ChatHistory { .. })).await {
        ServerFrame::ChatHistory { messages } => {
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].message, "first");
            assert_eq!(messages[1].message, "second");
        }
        _ => unreachable!(),
    }
    assert!(timeout(Duration::from_millis(200), ea.recv()).await.is_err());
}

#[tokio::test]
async fn test_file_lifecycle_broadcast() {
    let a = identity("a");
    let b = identity("b");
    let env = start_test_server(&[("tok-a", a.clone()), ("tok-b", b.clone())]).await;
    let room_id = seed_room_with_member(&env.store, a.user_id, "a").await;
    env.store.seed_user(b.user_id, "b").await;
    env.store.seed_member(room_id, b.user_id).await;

    let (ca, mut ea) = join_client(&env, "tok-a", &a, room_id).await;
    let (_cb, mut eb) = join_client(&env, "tok-b", &b, room_id).await;

    ca.create_file("lib.rs", "rust").await.unwrap();

    let file_id = match wait_for(&mut eb, |f| matches!(f, ServerFrame::FileCreated { .. })).await {
        ServerFrame::FileCreated { file } => {
            assert_eq!(file.name, "lib.rs");
            assert_eq!(file.language, "rust");
            file.id
        }
        _ => unreachable!(),
    };
    wait_for(&mut ea, |f| matches!(f, ServerFrame::FileCreated { .. })).await;
    assert_eq!(env.store.list_files(room_id).await.unwrap().len(), 1);

    ca.delete_file(file_id).await.unwrap();
    match wait_for(&mut eb, |f| matches!(f, ServerFrame::FileDeleted { .. })).await {
        ServerFrame::FileDeleted { file_id: deleted } => assert_eq!(deleted, file_id),
        _ => unreachable!(),
    }
    assert!(env.store.list_files(room_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_edit_missing_file_errors_and_session_survives() {
    let a = identity("a");
    let env = start_test_server(&[("tok-a", a.clone())]).await;
    let room_id = seed_room_with_member(&env.store, a.user_id, "a").await;

    let (ca, mut ea) = join_client(&env, "tok-a", &a, room_id).await;
    ca.send_insert(Uuid::new_v4(), 0, "x").await.unwrap();

    match wait_for(&mut ea, |f| matches!(f, ServerFrame::Error { .. })).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, "not-found"),
        _ => unreachable!(),
    }
    // Connection survives: chat still round-trips.
    ca.send_chat("still here", None).await.unwrap();
    wait_for(&mut ea, |f| matches!(f, ServerFrame::ChatMessage(_))).await;
}

#[tokio::test]
async fn test_frame_in_wrong_state_replies_invalid_state() {
    let a = identity("a");
    let env = start_test_server(&[("tok-a", a.clone())]).await;

    let mut client = CollabClient::new(a.user_id);
    client.connect(&env.url, Some("tok-a")).await.unwrap();
    let mut events = client.take_event_rx().unwrap();

    // code-change while merely authenticated (never joined).
    client.send_insert(Uuid::new_v4(), 0, "x").await.unwrap();
    match next_frame(&mut events).await {
        ServerFrame::Error { code, message } => {
            assert_eq!(code, "invalid-state");
            assert_eq!(message, "invalid state");
        }
        other => panic!("expected error, got {other:?}"),
    }
    // Still connected.
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
}
