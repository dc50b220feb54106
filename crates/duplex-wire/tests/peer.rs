//! End-to-end tests: two peers in one process talking over real sockets.

use bytes::Bytes;
use duplex_wire::message::{CHANNEL_TYPE, REJECT_EMPTY_SERVICE, REJECT_PARSE};
use duplex_wire::transport::{Session, TransportConfig};
use duplex_wire::{
    keys, Endpoint, Peer, PeerConfig, PeerConnection, PinnedKey, RejectionReason, WireError,
};
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::time::Duration;

/// Alice listening on an ephemeral TCP port, and Bob sharing her key.
async fn alice_and_bob() -> (Peer, Peer, Endpoint) {
    let key = keys::generate();
    let alice = Peer::new(PeerConfig::new("alice", key.clone()));
    let bob = Peer::new(PeerConfig::new("bob", key));
    let endpoint = alice
        .bind(&"tcp://127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (alice, bob, endpoint)
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn inbound_connection(peer: &Peer) -> PeerConnection {
    eventually(|| !peer.connections().is_empty()).await;
    peer.connections().remove(0)
}

fn rejection<T: std::fmt::Debug>(result: Result<T, WireError>) -> (RejectionReason, String) {
    match result {
        Err(WireError::ChannelRejected { reason, message }) => (reason, message),
        other => panic!("Expected ChannelRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_end_to_end_echo() {
    let (alice, bob, endpoint) = alice_and_bob().await;

    let conn = bob.connect(&endpoint).await.unwrap();
    assert_eq!(conn.name(), "alice");
    assert_eq!(conn.addr(), endpoint.to_string());
    assert!(bob.connection(&endpoint.to_string()).is_some());

    let mut ours = conn.open("echo", vec!["v=1".to_string()]).await.unwrap();
    assert_eq!(ours.service(), "echo");

    let mut theirs = alice.accept().await.unwrap();
    assert_eq!(theirs.service(), "echo");
    assert_eq!(theirs.headers(), &["v=1".to_string()]);

    ours.write_frame(b"ping").await.unwrap();
    assert_eq!(theirs.read_frame().await.unwrap(), b"ping");

    theirs.write_frame(b"pong").await.unwrap();
    assert_eq!(ours.read_frame().await.unwrap(), b"pong");

    // The accepting side names the connection after the dialer.
    let inbound = inbound_connection(&alice).await;
    assert_eq!(inbound.name(), "bob");
    assert!(inbound.addr().starts_with("tcp://127.0.0.1:"));
}

#[tokio::test]
async fn test_foreign_key_is_refused() {
    let (alice, _bob, endpoint) = alice_and_bob().await;
    let mallory = Peer::new(PeerConfig::new("mallory", keys::generate()));

    assert!(mallory.connect(&endpoint).await.is_err());
    assert!(mallory.connections().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.connections().is_empty());
}

#[tokio::test]
async fn test_allow_listed_key_is_accepted() {
    let alice_key = keys::generate();
    let carol_key = keys::generate();

    let mut alice_config = PeerConfig::new("alice", alice_key.clone());
    alice_config.authorizer = Arc::new(duplex_wire::AllowList::new(vec![
        alice_key.verifying_key(),
        carol_key.verifying_key(),
    ]));
    let alice = Peer::new(alice_config);
    let endpoint = alice
        .bind(&"tcp://127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut carol_config = PeerConfig::new("carol", carol_key);
    carol_config.authorizer = Arc::new(PinnedKey::new(alice_key.verifying_key()));
    let carol = Peer::new(carol_config);

    let conn = carol.connect(&endpoint).await.unwrap();
    assert_eq!(conn.name(), "alice");
}

#[tokio::test]
async fn test_concurrent_opens_keep_metadata_paired() {
    let (alice, bob, endpoint) = alice_and_bob().await;
    let conn = bob.connect(&endpoint).await.unwrap();

    let mut openers = Vec::new();
    for i in 0..16 {
        let conn = conn.clone();
        openers.push(tokio::spawn(async move {
            conn.open(&format!("svc-{i}"), vec![format!("id={i}"), "x".to_string()])
                .await
                .unwrap()
        }));
    }

    let mut seen = Vec::new();
    for _ in 0..16 {
        let channel = alice.accept().await.unwrap();
        let id = channel.service().trim_start_matches("svc-").to_string();
        assert_eq!(
            channel.headers(),
            &[format!("id={id}"), "x".to_string()],
            "headers paired with the wrong service"
        );
        seen.push(id.parse::<u32>().unwrap());
    }
    seen.sort();
    assert_eq!(seen, (0..16).collect::<Vec<_>>());

    for opener in openers {
        opener.await.unwrap();
    }
}

#[tokio::test]
async fn test_invalid_channel_opens_are_rejected() {
    let (_alice, bob, endpoint) = alice_and_bob().await;
    let conn = bob.connect(&endpoint).await.unwrap();

    let (reason, message) = rejection(
        conn.session()
            .open_channel(CHANNEL_TYPE, Bytes::from_static(&[0xc1]))
            .await,
    );
    assert_eq!(reason, RejectionReason::UnknownChannelType);
    assert_eq!(message, REJECT_PARSE);

    let (reason, message) = rejection(conn.open("", vec!["v=1".to_string()]).await);
    assert_eq!(reason, RejectionReason::UnknownChannelType);
    assert_eq!(message, REJECT_EMPTY_SERVICE);

    // Sibling channels and the connection are unaffected.
    assert!(!conn.is_closed());
    conn.open("echo", Vec::new()).await.unwrap();
}

#[tokio::test]
async fn test_out_of_band_requests_are_declined() {
    let (alice, bob, endpoint) = alice_and_bob().await;
    let conn = bob.connect(&endpoint).await.unwrap();
    let inbound = inbound_connection(&alice).await;

    assert!(!conn.keepalive().await.unwrap());
    assert!(!inbound.keepalive().await.unwrap());
    let (ok, _) = conn
        .session()
        .send_request("custom@example", true, Bytes::from_static(b"?"))
        .await
        .unwrap();
    assert!(!ok);

    assert!(!conn.is_closed());
    assert!(!inbound.is_closed());
    conn.open("echo", Vec::new()).await.unwrap();
}

#[tokio::test]
async fn test_either_side_may_open() {
    let (alice, bob, endpoint) = alice_and_bob().await;
    let conn = bob.connect(&endpoint).await.unwrap();
    let inbound = inbound_connection(&alice).await;

    let mut from_alice = inbound.open("notify", Vec::new()).await.unwrap();
    let mut at_bob = bob.accept().await.unwrap();
    assert_eq!(at_bob.service(), "notify");

    from_alice.write_frame(b"hello bob").await.unwrap();
    assert_eq!(at_bob.read_frame().await.unwrap(), b"hello bob");

    at_bob.write_error(b"not interested").await.unwrap();
    assert_eq!(from_alice.read_error().await.unwrap(), b"not interested");
    drop(conn);
}

#[tokio::test]
async fn test_disconnect_aborts_reads_and_evicts() {
    let (alice, bob, endpoint) = alice_and_bob().await;
    let conn = bob.connect(&endpoint).await.unwrap();
    let _ours = conn.open("echo", Vec::new()).await.unwrap();
    let mut theirs = alice.accept().await.unwrap();
    let inbound = inbound_connection(&alice).await;

    let reader = tokio::spawn(async move { theirs.read_frame().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    bob.disconnect(conn.addr()).unwrap();

    assert!(reader.await.unwrap().is_err());
    assert!(bob.connections().is_empty());
    inbound.closed().await;
    eventually(|| alice.connections().is_empty()).await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let (alice, bob, endpoint) = alice_and_bob().await;
    let conn = bob.connect(&endpoint).await.unwrap();
    inbound_connection(&alice).await;

    alice.shutdown();
    assert!(alice.listeners().is_empty());
    assert!(alice.connections().is_empty());
    assert!(alice.accept().await.is_none());

    conn.closed().await;
    eventually(|| bob.connections().is_empty()).await;
}

#[tokio::test]
async fn test_open_dials_on_demand() {
    let (alice, bob, endpoint) = alice_and_bob().await;
    let mut ours = bob.open(&endpoint, "echo", Vec::new()).await.unwrap();
    assert_eq!(bob.connections().len(), 1);

    let mut theirs = alice.accept().await.unwrap();
    ours.write_frame(b"1").await.unwrap();
    assert_eq!(theirs.read_frame().await.unwrap(), b"1");

    // A second open reuses the registered connection.
    bob.open(&endpoint, "echo", Vec::new()).await.unwrap();
    assert_eq!(bob.connections().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_open_shares_one_dial() {
    let (alice, bob, endpoint) = alice_and_bob().await;

    let mut openers = Vec::new();
    for i in 0..8 {
        let bob = bob.clone();
        let endpoint = endpoint.clone();
        openers.push(tokio::spawn(async move {
            let mut channel = bob
                .open(&endpoint, &format!("svc-{i}"), Vec::new())
                .await
                .unwrap();
            channel.write_frame(format!("{i}").as_bytes()).await.unwrap();
            channel
        }));
    }
    let mut channels = Vec::new();
    for opener in openers {
        channels.push(opener.await.unwrap());
    }

    let mut seen = Vec::new();
    for _ in 0..8 {
        let mut theirs = alice.accept().await.unwrap();
        let body = theirs.read_frame().await.unwrap();
        assert_eq!(theirs.service(), format!("svc-{}", String::from_utf8(body).unwrap()));
        seen.push(theirs.service().to_string());
    }
    assert_eq!(seen.len(), 8);

    assert_eq!(bob.connections().len(), 1);
    assert!(!bob.connections()[0].is_closed());
    eventually(|| alice.connections().len() == 1).await;
    drop(channels);
}

#[tokio::test]
async fn test_greeting_timeout() {
    let key = keys::generate();
    let config = TransportConfig {
        authorizer: Arc::new(PinnedKey::new(key.verifying_key())),
        signing_key: key.clone(),
        handshake_timeout: Duration::from_secs(5),
    };

    // A server that authenticates but never greets.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (session, _incoming) = Session::server(stream, &config).await.unwrap();
        session.closed().await;
    });

    let mut bob_config = PeerConfig::new("bob", key);
    bob_config.greeting_timeout = Duration::from_millis(100);
    let bob = Peer::new(bob_config);
    let result = bob.connect(&Endpoint::Tcp(addr.to_string())).await;
    assert!(matches!(result, Err(WireError::Timeout("greeting"))));
    assert!(bob.connections().is_empty());
}

#[tokio::test]
async fn test_connect_refused() {
    let bob = Peer::new(PeerConfig::new("bob", SigningKey::from_bytes(&[7u8; 32])));
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    assert!(matches!(
        bob.connect(&Endpoint::Tcp(addr.to_string())).await,
        Err(WireError::Io(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_with_stale_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice.sock");
    std::fs::write(&path, b"stale").unwrap();

    let key = keys::generate();
    let alice = Peer::new(PeerConfig::new("alice", key.clone()));
    let bob = Peer::new(PeerConfig::new("bob", key));
    let endpoint = alice.bind(&Endpoint::Unix(path.clone())).await.unwrap();
    assert_eq!(endpoint, Endpoint::Unix(path.clone()));

    let conn = bob.connect(&endpoint).await.unwrap();
    assert_eq!(conn.name(), "alice");
    let mut ours = conn.open("echo", vec!["v=1".to_string()]).await.unwrap();
    let mut theirs = alice.accept().await.unwrap();
    ours.write_frame(b"ping").await.unwrap();
    assert_eq!(theirs.read_frame().await.unwrap(), b"ping");

    let inbound = inbound_connection(&alice).await;
    assert!(inbound.addr().starts_with("unix://"));

    alice.unbind(&endpoint).unwrap();
    assert!(!path.exists());
}
