//! End-to-end tests: a real server, real sockets, real clients.

mod common;

use common::*;
use tandem_sync::{
    Message, ServerConfig, SyncClient, SyncEvent, SyncMessage, YrsDocument,
    AUTH_FAILURE_CLOSE_CODE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Issue a plain HTTP/1.1 GET and return the whole response.
async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(RECV_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    response
}

async fn wait_for<F>(rx: &mut tokio::sync::mpsc::Receiver<SyncEvent>, mut matches: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(RECV_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ── Transport ────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_route_on_same_listener() {
    let (server, addr) = start_dev_server().await;

    let response = http_get(addr, "/health").await;

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("okay"));
    assert_eq!(server.stats().await.health_checks, 1);
    // A health check never creates a session.
    assert_eq!(server.stats().await.active_sessions, 0);
}

#[tokio::test]
async fn test_plain_get_on_root_is_health() {
    let (server, addr) = start_dev_server().await;

    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("okay"));
    assert_eq!(server.stats().await.health_checks, 1);
}

#[tokio::test]
async fn test_bare_tcp_connect_leaves_server_serving() {
    let (server, addr) = start_dev_server().await;

    // Connect and hang up without sending a request.
    drop(tokio::net::TcpStream::connect(addr).await.unwrap());
    let mut half = tokio::net::TcpStream::connect(addr).await.unwrap();
    half.write_all(b"GET /hea").await.unwrap();
    drop(half);

    let response = http_get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let stats = server.stats().await;
    assert_eq!(stats.health_checks, 1);
    assert_eq!(stats.total_connections, 0);
}

#[tokio::test]
async fn test_upgrade_without_document_name_rejected() {
    let (server, addr) = start_dev_server().await;

    match tokio_tungstenite::connect_async(format!("{}/", ws_url(addr))).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }
    assert!(server.registry().is_empty().await);
    assert_eq!(server.stats().await.total_connections, 0);
}

#[tokio::test]
async fn test_document_name_is_percent_decoded() {
    let (server, addr) = start_dev_server().await;

    let _peer = RawPeer::join(addr, "team%20notes/todo.md").await;
    assert!(server.registry().get("team notes/todo.md").await.is_some());
}

#[tokio::test]
async fn test_handshake_is_step1() {
    let (server, addr) = start_dev_server().await;
    let mut peer = RawPeer::connect(addr, "doc-42", None).await;

    let handshake = peer.expect_frame().await;
    let session = server.registry().get("doc-42").await.unwrap();
    match handshake {
        Message::Sync(SyncMessage::Step1(sv)) => assert_eq!(sv, session.state_vector()),
        other => panic!("expected Step1, got {other:?}"),
    }
    // No awareness entries yet, so no snapshot follows.
    peer.expect_silence().await;
}

// ── Connection gate ──────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_token_closed_with_auth_code() {
    let (server, addr) = start_server(ServerConfig::default().with_secret(SECRET)).await;

    let mut peer = RawPeer::connect(addr, "doc-42", Some("not-a-token")).await;
    assert_eq!(peer.recv().await, Received::Closed(Some(AUTH_FAILURE_CLOSE_CODE)));

    // The session was never touched.
    assert!(server.registry().get("doc-42").await.is_none());
    assert_eq!(server.stats().await.rejected_connections, 1);
}

#[tokio::test]
async fn test_token_signed_with_other_secret_rejected() {
    let (_server, addr) = start_server(ServerConfig::default().with_secret(SECRET)).await;

    let forged = mint_token("some-other-secret", "mallory");
    let mut peer = RawPeer::connect(addr, "doc", Some(&forged)).await;
    assert_eq!(peer.recv().await, Received::Closed(Some(AUTH_FAILURE_CLOSE_CODE)));
}

#[tokio::test]
async fn test_missing_secret_without_dev_mode_rejects() {
    let (_server, addr) = start_server(ServerConfig::default()).await;

    let mut peer = RawPeer::connect(addr, "doc", None).await;
    assert_eq!(peer.recv().await, Received::Closed(Some(AUTH_FAILURE_CLOSE_CODE)));
}

#[tokio::test]
async fn test_valid_token_admitted() {
    let (server, addr) = start_server(ServerConfig::default().with_secret(SECRET)).await;

    let token = mint_token(SECRET, "alice");
    let mut peer = RawPeer::connect(addr, "doc-42", Some(&token)).await;
    assert!(matches!(
        peer.expect_frame().await,
        Message::Sync(SyncMessage::Step1(_))
    ));

    let session = server.registry().get("doc-42").await.unwrap();
    assert_eq!(session.member_count(), 1);
}

#[tokio::test]
async fn test_dev_mode_admits_without_token() {
    let (server, addr) = start_dev_server().await;

    let _peer = RawPeer::join(addr, "doc").await;
    let session = server.registry().get("doc").await.unwrap();
    assert_eq!(session.member_count(), 1);
}

// ── Fan-out ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_doc_42_scenario() {
    let (server, addr) = start_dev_server().await;
    let mut a = RawPeer::join(addr, "doc-42").await;
    let mut b = RawPeer::join(addr, "doc-42").await;
    let mut c = RawPeer::join(addr, "doc-42").await;
    let session = server.registry().get("doc-42").await.unwrap();

    // B announces presence so its disconnect has something to clear.
    let b_client = 2_002;
    let presence = tandem_sync::AwarenessUpdate::new(vec![tandem_sync::AwarenessChange::set(
        b_client,
        1,
        r#"{"user":"b"}"#,
    )]);
    b.send(&Message::awareness(presence.encode())).await;
    assert!(matches!(a.expect_frame().await, Message::Awareness(_)));
    assert!(matches!(c.expect_frame().await, Message::Awareness(_)));
    let awareness_before = session.awareness_len();

    // A sends U1.
    let author = YrsDocument::new();
    let u1 = append(&author, "U1");
    a.send(&Message::update(u1)).await;

    for peer in [&mut b, &mut c] {
        assert!(matches!(
            peer.expect_frame().await,
            Message::Sync(SyncMessage::Update(_))
        ));
        peer.expect_silence().await; // exactly once
    }
    a.expect_silence().await; // no echo
    assert_eq!(session.awareness_len(), awareness_before);

    // B disconnects.
    b.close().await;
    match c.expect_frame().await {
        Message::Awareness(bytes) => {
            let delta = tandem_sync::AwarenessUpdate::decode(&bytes).unwrap();
            assert_eq!(delta.changes.len(), 1);
            assert_eq!(delta.changes[0].client_id, b_client);
            assert!(delta.changes[0].is_removal());
        }
        other => panic!("expected awareness removal, got {other:?}"),
    }
    assert!(eventually(|| session.connection_ids().len() == 2).await);
    assert_eq!(session.member_count(), 2);
}

#[tokio::test]
async fn test_malformed_frame_dropped_connection_survives() {
    let (server, addr) = start_dev_server().await;
    let mut a = RawPeer::join(addr, "doc").await;
    let mut b = RawPeer::join(addr, "doc").await;

    a.send_raw(vec![0xFF, 0xFF, 0xFF]).await;
    a.send(&Message::update(vec![0xFF, 0xFF, 0xFF])).await;
    b.expect_silence().await;

    // Same connection keeps working.
    let author = YrsDocument::new();
    a.send(&Message::update(append(&author, "after garbage"))).await;
    assert!(matches!(
        b.expect_frame().await,
        Message::Sync(SyncMessage::Update(_))
    ));

    let stats = server.stats().await;
    assert_eq!(stats.frames_dropped, 2);
    assert_eq!(stats.active_connections, 2);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (_server, addr) = start_dev_server().await;
    let mut a = RawPeer::join(addr, "alpha").await;
    let mut other = RawPeer::join(addr, "beta").await;

    let author = YrsDocument::new();
    a.send(&Message::update(append(&author, "only alpha"))).await;
    other.expect_silence().await;
}

// ── Sync ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fresh_peer_sync() {
    let (server, addr) = start_dev_server().await;
    let session = server.registry().get_or_create("notes").await;

    let mut alice = SyncClient::new(ws_url(addr), "notes");
    alice.connect().await.unwrap();
    alice
        .edit(|txn| {
            use yrs::{Text, WriteTxn};
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "existing content");
        })
        .await
        .unwrap();
    assert!(eventually(|| session.with_doc(read_text) == "existing content").await);

    let mut bob = SyncClient::new(ws_url(addr), "notes");
    let mut events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::StateSynced)).await;

    assert_eq!(bob.with_doc(read_text), "existing content");
    assert_eq!(bob.state_vector(), session.state_vector());
}

#[tokio::test]
async fn test_convergence_many_clients() {
    let (server, addr) = start_dev_server().await;
    let session = server.registry().get_or_create("shared").await;

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut client = SyncClient::new(ws_url(addr), "shared");
        client.connect().await.unwrap();
        clients.push(client);
    }

    for round in 0..5 {
        for (i, client) in clients.iter().enumerate() {
            client
                .edit(|txn| {
                    use yrs::{Text, WriteTxn};
                    let text = txn.get_or_insert_text("content");
                    text.insert(txn, 0, &format!("[{i}:{round}]"));
                })
                .await
                .unwrap();
        }
    }

    let converged = eventually(|| {
        let reference = session.with_doc(read_text);
        reference.len() == 4 * 5 * 5
            && clients.iter().all(|c| c.with_doc(read_text) == reference)
    })
    .await;
    assert!(converged, "all replicas should converge");

    let sv = session.state_vector();
    assert!(clients.iter().all(|c| c.state_vector() == sv));
}

#[tokio::test]
async fn test_offline_edits_synced_on_reconnect() {
    let (server, addr) = start_dev_server().await;
    let session = server.registry().get_or_create("draft").await;

    let mut client = SyncClient::new(ws_url(addr), "draft");
    client.connect().await.unwrap();
    client.disconnect().await;

    client
        .edit(|txn| {
            use yrs::{Text, WriteTxn};
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "written offline");
        })
        .await
        .unwrap();

    client.connect().await.unwrap();
    assert!(eventually(|| session.with_doc(read_text) == "written offline").await);
}

#[tokio::test]
async fn test_client_sees_auth_close_code() {
    let (_server, addr) = start_server(ServerConfig::default().with_secret(SECRET)).await;

    let mut client = SyncClient::new(ws_url(addr), "doc").with_token("bogus");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected { .. })).await;
    match event {
        SyncEvent::Disconnected { code } => assert_eq!(code, Some(AUTH_FAILURE_CLOSE_CODE)),
        _ => unreachable!(),
    }
}

// ── Session lifetime ─────────────────────────────────────────────

#[tokio::test]
async fn test_idle_session_evicted_after_grace() {
    let config = ServerConfig::default()
        .with_dev_mode(true)
        .with_session_grace(Duration::from_millis(100));
    let (server, addr) = start_server(config).await;

    let peer = RawPeer::join(addr, "ephemeral").await;
    assert!(server.registry().get("ephemeral").await.is_some());
    peer.close().await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(server.registry().get("ephemeral").await.is_none());
}

#[tokio::test]
async fn test_sessions_kept_without_grace() {
    let (server, addr) = start_dev_server().await;

    let peer = RawPeer::join(addr, "kept").await;
    peer.close().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = server.registry().get("kept").await.unwrap();
    assert_eq!(session.member_count(), 0);
}
