//! Tests for TCP connections and the acceptor.

use std::collections::HashSet;
use std::time::Duration;

use networker::NetworkError;
use networker::tcp::{
    Acceptor, AcceptorConfig, AcceptorState, Connection, ConnectionConfig, ConnectionState,
    ReceiveMode, Uid,
};
use tokio::io::AsyncWriteExt;

/// Poll `condition` every 10ms for up to two seconds.
async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn local_acceptor(connection: ConnectionConfig) -> Acceptor {
    let config = AcceptorConfig::new("127.0.0.1", 0).connection_config(connection);
    Acceptor::bind_with_config(config)
        .await
        .expect("Acceptor should bind")
}

/// Returns `(server side, client side)` of a fresh link.
async fn connected_pair(server: ConnectionConfig) -> (Acceptor, Connection, Connection) {
    let acceptor = local_acceptor(server).await;
    let (accepted, dialed) = tokio::join!(
        acceptor.accept(),
        Connection::dial("127.0.0.1", acceptor.port())
    );
    (
        acceptor,
        accepted.expect("accept should succeed"),
        dialed.expect("dial should succeed"),
    )
}

/// Wait for the greeting line and parse its UID.
async fn read_greeting(client: &Connection) -> Uid {
    let mut greeting = None;
    assert!(
        wait_until(|| {
            greeting = client.receive_text();
            greeting.is_some()
        })
        .await,
        "no greeting received"
    );
    let line = greeting.unwrap();
    Uid::parse_greeting(&line).unwrap_or_else(|| panic!("not a greeting: {line:?}"))
}

#[test]
fn test_state_display() {
    assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
    assert_eq!(ConnectionState::Connected.to_string(), "Connected");
    assert_eq!(ConnectionState::Closing.to_string(), "Closing");

    assert_eq!(AcceptorState::Bound.to_string(), "Bound");
    assert_eq!(AcceptorState::Idle.to_string(), "Idle");
    assert_eq!(AcceptorState::AcceptingSync.to_string(), "AcceptingSync");
    assert_eq!(AcceptorState::AcceptingAsync.to_string(), "AcceptingAsync");
    assert_eq!(AcceptorState::Stopped.to_string(), "Stopped");

    assert_eq!(ReceiveMode::Text.to_string(), "Text");
    assert_eq!(ReceiveMode::Binary.to_string(), "Binary");
}

#[tokio::test]
async fn test_text_lines_arrive_in_order() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    let lines = ["first", "second", "", "fourth with spaces", "fifth"];
    for line in lines {
        client.send_line(line).await.unwrap();
    }

    assert!(wait_until(|| server.all_text_messages().len() == lines.len()).await);
    assert_eq!(server.all_text_messages(), lines);

    // Snapshot does not drain; polling does.
    assert_eq!(server.receive_text().as_deref(), Some("first"));
    assert_eq!(server.all_text_messages().len(), lines.len() - 1);
}

#[tokio::test]
async fn test_send_text_adds_no_terminator() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    client.send_text("partial").await.unwrap();
    client.send_text(" line\r\nnext\n").await.unwrap();

    assert!(wait_until(|| server.all_text_messages().len() == 2).await);
    assert_eq!(server.all_text_messages(), ["partial line", "next"]);
}

#[tokio::test]
async fn test_binary_single_chunk() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::new().binary()).await;
    assert_eq!(server.receive_mode(), ReceiveMode::Binary);

    client.send_bytes(&[0x01, 0x02, 0x03]).await.unwrap();

    assert!(wait_until(|| !server.all_binary_messages().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let chunks = server.all_binary_messages();
    assert_eq!(chunks.len(), 1);
    assert_eq!(&chunks[0][..], &[0x01, 0x02, 0x03]);
    assert!(server.all_text_messages().is_empty());
}

#[tokio::test]
async fn test_binary_stream_reassembles_exactly() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::new().binary()).await;

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    for part in payload.chunks(3_333) {
        client.send_bytes(part).await.unwrap();
    }

    let total = || {
        server
            .all_binary_messages()
            .iter()
            .map(|chunk| chunk.len())
            .sum::<usize>()
    };
    assert!(wait_until(|| total() == payload.len()).await);

    let chunks = server.all_binary_messages();
    assert!(chunks.iter().all(|chunk| !chunk.is_empty() && chunk.len() <= 1024));
    let received: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_custom_chunk_size() {
    let (_acceptor, server, client) =
        connected_pair(ConnectionConfig::new().binary().read_chunk_size(4)).await;

    client.send_bytes(b"0123456789").await.unwrap();

    let total = || server.all_binary_messages().iter().map(|c| c.len()).sum::<usize>();
    assert!(wait_until(|| total() == 10).await);
    assert!(server.all_binary_messages().iter().all(|c| c.len() <= 4));
}

#[tokio::test]
async fn test_mode_switch_requires_restart() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    client.send_line("before").await.unwrap();
    assert!(wait_until(|| server.all_text_messages().len() == 1).await);

    server.set_receiver_to_binary();
    assert_eq!(server.receive_mode(), ReceiveMode::Binary);
    server.restart_listening().await.unwrap();

    client.send_bytes(&[9, 8, 7]).await.unwrap();
    assert!(wait_until(|| !server.all_binary_messages().is_empty()).await);

    assert_eq!(server.all_text_messages(), ["before"]);
    assert_eq!(&server.receive_bytes().unwrap()[..], &[9, 8, 7]);

    server.set_receiver_to_text();
    server.restart_listening().await.unwrap();
    client.send_line("after").await.unwrap();

    assert!(wait_until(|| server.all_text_messages().len() == 2).await);
    assert_eq!(server.all_text_messages(), ["before", "after"]);
    assert!(server.all_binary_messages().is_empty());
}

#[tokio::test]
async fn test_mode_switch_keeps_unterminated_text() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    client.send_text("abc").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.all_text_messages().is_empty());

    server.set_receiver_to_binary();
    server.restart_listening().await.unwrap();
    client.send_text("def").await.unwrap();

    let received = || {
        server
            .all_binary_messages()
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .collect::<Vec<u8>>()
    };
    assert!(wait_until(|| received().len() == 6).await);
    assert_eq!(received(), b"abcdef");
}

#[tokio::test]
async fn test_stop_listening_interrupts_pending_read() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;
    assert!(server.is_listening());

    tokio::time::timeout(Duration::from_secs(1), server.stop_listening())
        .await
        .expect("stop should not wait for data")
        .unwrap();
    assert!(!server.is_listening());
    assert!(!server.is_receiving());

    client.send_line("queued in the socket").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.receive_text(), None);

    server.start_listening().await.unwrap();
    assert!(wait_until(|| server.all_text_messages().len() == 1).await);
    assert_eq!(server.receive_text().as_deref(), Some("queued in the socket"));
}

#[tokio::test]
async fn test_start_listening_is_idempotent() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    server.start_listening().await.unwrap();
    server.start_listening().await.unwrap();
    assert!(server.is_listening());

    client.send_line("once").await.unwrap();
    assert!(wait_until(|| server.all_text_messages().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.all_text_messages(), ["once"]);
}

#[tokio::test]
async fn test_manual_listen() {
    let (_acceptor, server, client) =
        connected_pair(ConnectionConfig::new().manual_listen()).await;
    assert!(server.is_connected());
    assert!(!server.is_listening());

    client.send_line("waiting").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.all_text_messages().is_empty());

    server.start_listening().await.unwrap();
    assert!(wait_until(|| server.all_text_messages() == ["waiting"]).await);
}

#[tokio::test]
async fn test_peer_close_ends_receive_loop() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;
    assert!(server.is_receiving());

    client.send_text("last words").await.unwrap();
    client.disconnect().await.unwrap();

    assert!(wait_until(|| !server.is_receiving()).await);
    // The flag is left for the caller to clear.
    assert!(server.is_listening());
    assert!(server.is_connected());
    assert_eq!(server.all_text_messages(), ["last words"]);
}

#[tokio::test]
async fn test_peer_reset_ends_receive_loop() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let (server, raw) = tokio::join!(
        acceptor.accept(),
        tokio::net::TcpStream::connect(("127.0.0.1", acceptor.port()))
    );
    let server = server.unwrap();
    let mut raw = raw.unwrap();

    raw.write_all(b"before reset\n").await.unwrap();
    assert!(wait_until(|| server.all_text_messages() == ["before reset"]).await);

    // Zero linger turns the close into a reset.
    #[allow(deprecated)]
    let linger = raw.set_linger(Some(Duration::ZERO));
    linger.unwrap();
    drop(raw);

    assert!(wait_until(|| !server.is_receiving()).await);
    assert!(server.is_listening());
    assert!(server.is_connected());
    assert_eq!(server.all_text_messages(), ["before reset"]);

    // The read error stayed inside the loop.
    server.stop_listening().await.unwrap();
    server.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    client.disconnect().await.unwrap();
    assert!(!client.is_connected());
    assert!(!client.is_listening());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.disconnect().await.unwrap();

    let result = client.send_text("too late").await;
    assert!(matches!(result, Err(NetworkError::NotConnected)));

    server.disconnect().await.ok();
}

#[tokio::test]
async fn test_reconnect_same_endpoint() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let port = acceptor.port();
    let accept_loop = acceptor.listen(2);

    let client = Connection::dial("127.0.0.1", port).await.unwrap();
    let id = client.id();
    let first = read_greeting(&client).await;

    client.disconnect().await.unwrap();
    assert!(!client.is_connected());

    client.reconnect().await.unwrap();
    assert!(client.is_connected());
    assert!(client.is_listening());
    assert_eq!(client.id(), id);
    assert_eq!(client.remote_host().as_deref(), Some("127.0.0.1"));
    assert_eq!(client.remote_port(), Some(port));
    assert_eq!(client.peer_addr().unwrap().port(), port);

    let second = read_greeting(&client).await;
    assert_ne!(first, second);

    assert_eq!(accept_loop.await.unwrap().unwrap(), 2);
}

#[tokio::test]
async fn test_reconnect_failure_leaves_disconnected() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let port = acceptor.port();
    let (accepted, client) = tokio::join!(
        acceptor.accept(),
        Connection::dial("127.0.0.1", port)
    );
    let client = client.unwrap();
    drop(accepted);
    drop(acceptor);

    let result = client.reconnect().await;
    assert!(matches!(result, Err(NetworkError::Dial { .. })));
    assert!(!client.is_connected());
    assert_eq!(client.remote_port(), Some(port));
}

#[tokio::test]
async fn test_dial_refused() {
    let port = local_acceptor(ConnectionConfig::default()).await.port();

    let result = Connection::dial("127.0.0.1", port).await;
    assert!(matches!(result, Err(NetworkError::Dial { .. })));
}

#[tokio::test]
async fn test_bind_port_in_use() {
    let first = local_acceptor(ConnectionConfig::default()).await;

    let result = Acceptor::bind_with_config(AcceptorConfig::new("127.0.0.1", first.port())).await;
    assert!(matches!(result, Err(NetworkError::Bind { .. })));
}

#[tokio::test]
async fn test_bind_free_port() {
    let acceptor = Acceptor::bind(None).await.unwrap();
    assert_ne!(acceptor.port(), 0);
    assert_eq!(acceptor.state(), AcceptorState::Bound);
    assert_eq!(acceptor.bind_addr(), "0.0.0.0:0");
    assert!(!acceptor.is_listening());
    assert_eq!(acceptor.connection_count(), 0);
}

#[tokio::test]
async fn test_sync_accept_is_not_registered() {
    let (acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    assert_eq!(acceptor.state(), AcceptorState::Idle);
    assert_eq!(acceptor.connection_count(), 0);
    assert!(acceptor.uids().is_empty());

    // No greeting on synchronously accepted connections.
    server.send_line("hello").await.unwrap();
    assert!(wait_until(|| client.all_text_messages() == ["hello"]).await);
}

#[tokio::test]
async fn test_greeting_is_first_line() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let accept_loop = acceptor.listen(1);

    let client = Connection::dial("127.0.0.1", acceptor.port()).await.unwrap();

    let mut first = None;
    assert!(
        wait_until(|| {
            first = client.receive_text();
            first.is_some()
        })
        .await
    );
    let first = first.unwrap();
    let digits = first.strip_prefix("UID: ").expect("greeting prefix");
    assert!(!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()));

    let uid = Uid::parse_greeting(&first).unwrap();
    assert!(wait_until(|| acceptor.contains(uid)).await);
    assert_eq!(accept_loop.await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn test_listen_assigns_distinct_uids() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let accept_loop = acceptor.listen(3);
    assert_eq!(acceptor.state(), AcceptorState::AcceptingAsync);
    assert!(acceptor.is_listening());

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(Connection::dial("127.0.0.1", acceptor.port()).await.unwrap());
    }

    let mut uids = Vec::new();
    for client in &clients {
        uids.push(read_greeting(client).await);
    }

    assert_eq!(uids.iter().collect::<HashSet<_>>().len(), 3);
    assert_eq!(accept_loop.await.unwrap().unwrap(), 3);
    assert!(!acceptor.is_listening());
    assert_eq!(acceptor.state(), AcceptorState::Idle);

    assert_eq!(acceptor.connection_count(), 3);
    uids.sort();
    assert_eq!(acceptor.uids(), uids);
    for uid in &uids {
        assert!(acceptor.connection(*uid).is_some());
    }

    // Each registered peer maps back to exactly one client.
    let client_addrs: HashSet<_> = clients.iter().map(|c| c.local_addr().unwrap()).collect();
    let peer_addrs: HashSet<_> = acceptor
        .connections()
        .iter()
        .map(|c| c.peer_addr().unwrap())
        .collect();
    assert_eq!(client_addrs, peer_addrs);
}

#[tokio::test]
async fn test_concurrent_accept_loops_register_each_peer_once() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let first_loop = acceptor.listen(6);
    let second_loop = acceptor.listen(6);

    let mut clients = Vec::new();
    for _ in 0..12 {
        clients.push(Connection::dial("127.0.0.1", acceptor.port()).await.unwrap());
    }
    let mut uids = HashSet::new();
    for client in &clients {
        assert!(uids.insert(read_greeting(client).await));
    }

    let accepted = first_loop.await.unwrap().unwrap() + second_loop.await.unwrap().unwrap();
    assert_eq!(accepted, 12);
    assert_eq!(acceptor.connection_count(), 12);
    assert_eq!(acceptor.uids().into_iter().collect::<HashSet<_>>(), uids);
    assert_eq!(acceptor.state(), AcceptorState::Idle);
}

#[tokio::test]
async fn test_stop_during_sync_accept_is_kept() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let port = acceptor.port();

    let (accepted, client) = tokio::join!(acceptor.accept(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acceptor.state(), AcceptorState::AcceptingSync);
        acceptor.stop_listening();
        Connection::dial("127.0.0.1", port).await
    });
    accepted.unwrap();
    client.unwrap();

    assert_eq!(acceptor.state(), AcceptorState::Stopped);
}

#[tokio::test]
async fn test_stop_listening_ends_accept_loop() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let accept_loop = acceptor.listen(10);

    tokio::time::sleep(Duration::from_millis(20)).await;
    acceptor.stop_listening();

    let accepted = tokio::time::timeout(Duration::from_secs(1), accept_loop)
        .await
        .expect("stop should interrupt accept")
        .unwrap()
        .unwrap();
    assert_eq!(accepted, 0);
    assert_eq!(acceptor.state(), AcceptorState::Stopped);

    // Listening can start again after a stop.
    let accept_loop = acceptor.listen(1);
    let client = Connection::dial("127.0.0.1", acceptor.port()).await.unwrap();
    read_greeting(&client).await;
    assert_eq!(accept_loop.await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn test_listen_zero() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    assert_eq!(acceptor.listen(0).await.unwrap().unwrap(), 0);
    assert_eq!(acceptor.connection_count(), 0);
}

#[tokio::test]
async fn test_send_to_and_broadcast() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let accept_loop = acceptor.listen(2);

    let alice = Connection::dial("127.0.0.1", acceptor.port()).await.unwrap();
    let bob = Connection::dial("127.0.0.1", acceptor.port()).await.unwrap();
    let alice_uid = read_greeting(&alice).await;
    let bob_uid = read_greeting(&bob).await;
    accept_loop.await.unwrap().unwrap();
    assert!(wait_until(|| acceptor.connection_count() == 2).await);

    assert_eq!(acceptor.broadcast_text("everyone\n").await, 2);
    acceptor.send_text_to(bob_uid, "just bob\n").await.unwrap();

    assert!(wait_until(|| bob.all_text_messages().len() == 2).await);
    assert!(wait_until(|| alice.all_text_messages().len() == 1).await);
    assert_eq!(alice.all_text_messages(), ["everyone"]);
    assert_eq!(bob.all_text_messages(), ["everyone", "just bob"]);

    // Messages from clients land in the registered server-side connection.
    alice.send_line("from alice").await.unwrap();
    let server_side = acceptor.connection(alice_uid).unwrap();
    assert!(wait_until(|| server_side.all_text_messages() == ["from alice"]).await);

    let unknown = Uid::from_u64(1);
    assert!(matches!(
        acceptor.send_text_to(unknown, "nobody").await,
        Err(NetworkError::UnknownUid(1))
    ));

    acceptor.disconnect_client(alice_uid).await.unwrap();
    assert!(!acceptor.contains(alice_uid));
    assert_eq!(acceptor.connection_count(), 1);
    assert!(wait_until(|| !alice.is_receiving()).await);
}

#[tokio::test]
async fn test_shutdown_disconnects_everyone() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let accept_loop = acceptor.listen(5);

    let client = Connection::dial("127.0.0.1", acceptor.port()).await.unwrap();
    let uid = read_greeting(&client).await;
    assert!(wait_until(|| acceptor.contains(uid)).await);
    let server_side = acceptor.connection(uid).unwrap();

    acceptor.shutdown().await;

    assert_eq!(accept_loop.await.unwrap().unwrap(), 1);
    assert_eq!(acceptor.connection_count(), 0);
    assert!(!server_side.is_connected());
    assert!(wait_until(|| !client.is_receiving()).await);
}

#[tokio::test]
async fn test_shutdown_while_peers_connect() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let accept_loop = acceptor.listen(16);
    let port = acceptor.port();

    let dials: Vec<_> = (0..16)
        .map(|_| tokio::spawn(tokio::net::TcpStream::connect(("127.0.0.1", port))))
        .collect();
    tokio::time::sleep(Duration::from_millis(5)).await;

    acceptor.shutdown().await;
    accept_loop.await.unwrap().unwrap();

    // Peers still being greeted at shutdown are turned away, not registered.
    assert_eq!(acceptor.connection_count(), 0);
    assert!(acceptor.uids().is_empty());
    assert_eq!(acceptor.state(), AcceptorState::Stopped);

    for dial in dials {
        let _ = dial.await.unwrap();
    }
}

#[tokio::test]
async fn test_broadcast_skips_disconnected_peers() {
    let acceptor = local_acceptor(ConnectionConfig::default()).await;
    let accept_loop = acceptor.listen(2);

    let alice = Connection::dial("127.0.0.1", acceptor.port()).await.unwrap();
    let bob = Connection::dial("127.0.0.1", acceptor.port()).await.unwrap();
    let alice_uid = read_greeting(&alice).await;
    read_greeting(&bob).await;
    accept_loop.await.unwrap().unwrap();

    // Still registered, but without a socket.
    acceptor.connection(alice_uid).unwrap().disconnect().await.unwrap();
    assert!(acceptor.contains(alice_uid));

    assert_eq!(acceptor.broadcast_text("still here?\n").await, 1);
    assert!(wait_until(|| bob.all_text_messages() == ["still here?"]).await);
}

#[tokio::test]
async fn test_connection_identity() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;

    assert_ne!(client, server);
    assert_ne!(client.id(), server.id());

    let mut set = HashSet::new();
    set.insert(client.id());
    set.insert(server.id());
    assert_eq!(set.len(), 2);

    let peer = server.peer_addr().unwrap();
    assert_eq!(server.to_string(), format!("Connection-A:[{peer}]"));
    assert_eq!(client.local_addr(), Some(peer));

    client.disconnect().await.unwrap();
    assert!(client.to_string().starts_with("Connection-C:["));
}

#[tokio::test]
async fn test_queue_handles_are_shared() {
    let (_acceptor, server, client) = connected_pair(ConnectionConfig::default()).await;
    let queue = server.text_queue();

    client.send_line("shared").await.unwrap();
    assert!(wait_until(|| queue.len() == 1).await);

    assert_eq!(queue.peek().as_deref(), Some("shared"));
    assert_eq!(server.receive_text().as_deref(), Some("shared"));
    assert!(queue.is_empty());
}
