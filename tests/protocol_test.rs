//! End-to-end protocol scenarios against a live engine.
//!
//! Each test starts a real node (listener, dispatcher, sender task) and
//! talks to it over loopback UDP through a hand-rolled fake peer, so the
//! wire format is exercised exactly as another implementation would see
//! it. The fake peer auto-ACKs reliable frames the way a conforming node
//! must.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lsnp::{NetConfig, NetEvent, Network, now};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

// =============================================================================
// HARNESS
// =============================================================================

type FrameFields = HashMap<String, String>;
type FrameStream = mpsc::Receiver<(String, FrameFields)>;

async fn start_node(name: &str) -> (Arc<Network>, mpsc::Receiver<NetEvent>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NetConfig::new(name);
    config.data_dir = dir.path().to_path_buf();
    config.download_dir = dir.path().join("downloads");
    let (network, events) = Network::start(config).await.unwrap();
    (network, events, dir)
}

fn build_frame(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = String::new();
    for (key, value) in fields {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    out.into_bytes()
}

fn parse_frame(raw: &[u8]) -> Option<(String, FrameFields)> {
    let text = std::str::from_utf8(raw).ok()?;
    let body = text.split("\n\n").next()?;
    let mut fields = HashMap::new();
    for line in body.lines() {
        let (key, value) = line.split_once(':')?;
        fields.insert(key.trim().to_string(), value.trim().to_string());
    }
    let ty = fields.get("TYPE")?.clone();
    Some((ty, fields))
}

/// A scripted remote peer on 127.0.0.1. A background task receives every
/// frame the node sends us, ACKs the reliable ones, and forwards them all
/// into the returned [`FrameStream`] for the test body to inspect.
struct FakePeer {
    name: String,
    socket: Arc<UdpSocket>,
    node_addr: SocketAddr,
}

impl FakePeer {
    async fn start(name: &str, node: &Network) -> (FakePeer, FrameStream) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let node_addr: SocketAddr =
            format!("127.0.0.1:{}", node.whoami().port()).parse().unwrap();
        let (tx, frames) = mpsc::channel(64);

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((len, _)) = recv_socket.recv_from(&mut buf).await else {
                    break;
                };
                let Some((ty, fields)) = parse_frame(&buf[..len]) else {
                    continue;
                };
                let reliable = matches!(
                    ty.as_str(),
                    "DM" | "TICTACTOE_INVITE"
                        | "TICTACTOE_MOVE"
                        | "TICTACTOE_RESULT"
                        | "GROUP_CREATE"
                        | "GROUP_UPDATE"
                        | "GROUP_MESSAGE"
                );
                if reliable {
                    if let Some(id) = fields.get("MESSAGE_ID") {
                        let ack = build_frame(&[
                            ("TYPE", "ACK"),
                            ("MESSAGE_ID", id),
                            ("STATUS", "RECEIVED"),
                        ]);
                        let _ = recv_socket.send_to(&ack, node_addr).await;
                    }
                }
                if tx.send((ty, fields)).await.is_err() {
                    break;
                }
            }
        });

        (FakePeer { name: name.to_string(), socket, node_addr }, frames)
    }

    fn user_id(&self) -> String {
        format!("{}@127.0.0.1:{}", self.name, self.socket.local_addr().unwrap().port())
    }

    fn token(&self, scope: &str) -> String {
        format!("{}|{}|{}", self.user_id(), now() + 3600, scope)
    }

    async fn send(&self, fields: &[(&str, &str)]) {
        self.socket.send_to(&build_frame(fields), self.node_addr).await.unwrap();
    }

    /// Introduce ourselves so the node's registry can resolve us.
    async fn announce(&self) {
        let user_id = self.user_id();
        let port = self.socket.local_addr().unwrap().port().to_string();
        self.send(&[
            ("TYPE", "PROFILE"),
            ("USER_ID", &user_id),
            ("DISPLAY_NAME", &self.name),
            ("STATUS", "testing"),
            ("PORT", &port),
        ])
        .await;
        // Give the dispatcher a beat to upsert before the test proceeds.
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    async fn send_move(&self, node: &Network, game: &str, turn: u32, pos: u8, sym: char, id: &str) {
        let user_id = self.user_id();
        let to = node.whoami().to_string();
        let token = self.token("game");
        self.send(&[
            ("TYPE", "TICTACTOE_MOVE"),
            ("FROM", &user_id),
            ("TO", &to),
            ("GAMEID", game),
            ("MESSAGE_ID", id),
            ("POSITION", &pos.to_string()),
            ("SYMBOL", &sym.to_string()),
            ("TURN", &turn.to_string()),
            ("TOKEN", &token),
        ])
        .await;
    }

    async fn send_post(&self, content: &str, token: &str) {
        let user_id = self.user_id();
        let ts = now().to_string();
        self.send(&[
            ("TYPE", "POST"),
            ("USER_ID", &user_id),
            ("CONTENT", content),
            ("TTL", "3600"),
            ("MESSAGE_ID", "0badcafe"),
            ("TIMESTAMP", &ts),
            ("TOKEN", token),
        ])
        .await;
    }
}

/// Next frame of the wanted TYPE, discarding everything else.
async fn expect_frame(frames: &mut FrameStream, want: &str) -> FrameFields {
    timeout(Duration::from_secs(5), async {
        loop {
            let (ty, fields) = frames.recv().await.expect("fake peer closed");
            if ty == want {
                return fields;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want}"))
}

async fn expect_event(
    events: &mut mpsc::Receiver<NetEvent>,
    what: &str,
    pred: impl Fn(&NetEvent) -> bool,
) -> NetEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn expect_quiet(events: &mut mpsc::Receiver<NetEvent>, pred: impl Fn(&NetEvent) -> bool) {
    let saw = timeout(Duration::from_millis(700), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await;
    assert!(saw.is_err(), "unexpected event: {:?}", saw.ok());
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn discovery_registers_peer_under_its_listener_port() {
    let (node, mut events, _dir) = start_node("disc_node").await;
    let (peer, _frames) = FakePeer::start("disc_bob", &node).await;

    // The wire user_id is partial; the PORT field plus canonicalisation
    // must yield the full id, with the port taken from the profile rather
    // than from the UDP source port of this particular datagram.
    let port = peer.socket.local_addr().unwrap().port().to_string();
    peer.send(&[
        ("TYPE", "PROFILE"),
        ("USER_ID", "disc_bob@127.0.0.1"),
        ("DISPLAY_NAME", "Bobby"),
        ("STATUS", "here"),
        ("PORT", &port),
    ])
    .await;

    expect_event(&mut events, "ProfileUpdated", |e| {
        matches!(e, NetEvent::ProfileUpdated { user_id, display_name, .. }
            if user_id == &peer.user_id() && display_name == "Bobby")
    })
    .await;

    let listed = node
        .peer_list()
        .into_iter()
        .find(|p| p.user_id.username() == "disc_bob")
        .expect("peer not registered");
    assert_eq!(listed.user_id.to_string(), peer.user_id());
    assert_eq!(listed.display_name, "Bobby");

    // Self-echo: a frame carrying the node's own user_id (its broadcast
    // looping back) is dropped before it can touch registry or events.
    let me = node.whoami().to_string();
    peer.send(&[
        ("TYPE", "PROFILE"),
        ("USER_ID", &me),
        ("DISPLAY_NAME", "Imposter"),
        ("STATUS", "echo"),
    ])
    .await;
    expect_quiet(&mut events, |e| {
        matches!(e, NetEvent::ProfileUpdated { user_id, .. } if user_id == &me)
    })
    .await;
    assert!(node.peer_list().iter().all(|p| p.user_id.to_string() != me));
}

#[tokio::test]
async fn dm_round_trip_with_ack() {
    let (node, mut events, _dir) = start_node("dm_node").await;
    let (peer, mut frames) = FakePeer::start("dm_bob", &node).await;
    peer.announce().await;

    // Outbound: the node's DM reaches the peer, and the auto-ACK makes the
    // call succeed without exhausting retries.
    node.dm("dm_bob", "hello over the LAN").await.expect("dm undelivered");
    let dm = expect_frame(&mut frames, "DM").await;
    assert_eq!(dm.get("CONTENT").unwrap(), "hello over the LAN");
    assert_eq!(dm.get("TO").unwrap(), &peer.user_id());

    // Inbound: a peer DM is surfaced and ACKed back.
    let user_id = peer.user_id();
    let to = node.whoami().to_string();
    let token = peer.token("chat");
    let dm_fields: Vec<(&str, &str)> = vec![
        ("TYPE", "DM"),
        ("FROM", &user_id),
        ("TO", &to),
        ("CONTENT", "hi yourself"),
        ("TIMESTAMP", "1700000000"),
        ("MESSAGE_ID", "abcd1234"),
        ("TOKEN", &token),
    ];
    peer.send(&dm_fields).await;
    expect_event(&mut events, "Dm", |e| {
        matches!(e, NetEvent::Dm { content, .. } if content == "hi yourself")
    })
    .await;
    let ack = expect_frame(&mut frames, "ACK").await;
    assert_eq!(ack.get("MESSAGE_ID").unwrap(), "abcd1234");
    assert_eq!(ack.get("STATUS").unwrap(), "RECEIVED");

    // A retransmission of the same MESSAGE_ID is re-ACKed, not re-surfaced.
    peer.send(&dm_fields).await;
    let ack = expect_frame(&mut frames, "ACK").await;
    assert_eq!(ack.get("MESSAGE_ID").unwrap(), "abcd1234");
    expect_quiet(&mut events, |e| matches!(e, NetEvent::Dm { .. })).await;
}

#[tokio::test]
async fn expired_and_revoked_tokens_are_dropped() {
    let (node, mut events, _dir) = start_node("tok_node").await;
    let (peer, _frames) = FakePeer::start("tok_bob", &node).await;
    peer.announce().await;
    let user_id = peer.user_id();
    let to = node.whoami().to_string();

    // Expired token: dropped, no event, counted.
    let stale = format!("{}|{}|broadcast", user_id, now() - 1);
    peer.send_post("too late", &stale).await;
    expect_quiet(&mut events, |e| matches!(e, NetEvent::Post { .. })).await;
    assert!(node.stats().dropped_invalid_token >= 1);

    // Wrong scope is equally dead.
    let chat_scoped = peer.token("chat");
    peer.send_post("wrong scope", &chat_scoped).await;
    expect_quiet(&mut events, |e| matches!(e, NetEvent::Post { .. })).await;

    // Revocation kills an otherwise valid token for good.
    let token = peer.token("chat");
    peer.send(&[
        ("TYPE", "DM"),
        ("FROM", &user_id),
        ("TO", &to),
        ("CONTENT", "first"),
        ("TIMESTAMP", "1"),
        ("MESSAGE_ID", "11110001"),
        ("TOKEN", &token),
    ])
    .await;
    expect_event(&mut events, "Dm", |e| {
        matches!(e, NetEvent::Dm { content, .. } if content == "first")
    })
    .await;

    peer.send(&[("TYPE", "REVOKE"), ("FROM", &user_id), ("TOKEN", &token)]).await;
    expect_event(&mut events, "TokenRevoked", |e| matches!(e, NetEvent::TokenRevoked { .. })).await;

    peer.send(&[
        ("TYPE", "DM"),
        ("FROM", &user_id),
        ("TO", &to),
        ("CONTENT", "second"),
        ("TIMESTAMP", "2"),
        ("MESSAGE_ID", "11110002"),
        ("TOKEN", &token),
    ])
    .await;
    expect_quiet(&mut events, |e| {
        matches!(e, NetEvent::Dm { content, .. } if content == "second")
    })
    .await;
}

#[tokio::test]
async fn token_ip_binding_rejects_spoofed_sender() {
    let (node, mut events, _dir) = start_node("bind_node").await;
    let (peer, _frames) = FakePeer::start("bind_bob", &node).await;
    peer.announce().await;
    let to = node.whoami().to_string();

    // The token embeds an ip that is not the UDP source; bind check drops
    // the frame even though the token is fresh and correctly scoped.
    let spoofed_id = "bind_bob@192.0.2.44:50999";
    let spoofed_token = format!("{}|{}|chat", spoofed_id, now() + 3600);
    peer.send(&[
        ("TYPE", "DM"),
        ("FROM", spoofed_id),
        ("TO", &to),
        ("CONTENT", "spoofed"),
        ("TIMESTAMP", "1"),
        ("MESSAGE_ID", "66660001"),
        ("TOKEN", &spoofed_token),
    ])
    .await;
    expect_quiet(&mut events, |e| matches!(e, NetEvent::Dm { .. })).await;
    assert!(node.stats().dropped_invalid_token >= 1);
}

#[tokio::test]
async fn post_visibility_follows_the_follow_graph() {
    let (node, mut events, _dir) = start_node("follow_node").await;
    let (peer, mut frames) = FakePeer::start("follow_bob", &node).await;
    peer.announce().await;

    peer.send_post("before follow", &peer.token("broadcast")).await;
    let event = expect_event(&mut events, "Post", |e| {
        matches!(e, NetEvent::Post { content, .. } if content == "before follow")
    })
    .await;
    assert!(matches!(event, NetEvent::Post { from_followed: false, .. }));

    node.follow("follow_bob").await.unwrap();
    let follow = expect_frame(&mut frames, "FOLLOW").await;
    assert_eq!(follow.get("TO").unwrap(), &peer.user_id());
    assert!(node.following().contains(&peer.user_id()));

    peer.send_post("after follow", &peer.token("broadcast")).await;
    let event = expect_event(&mut events, "Post", |e| {
        matches!(e, NetEvent::Post { content, .. } if content == "after follow")
    })
    .await;
    assert!(matches!(event, NetEvent::Post { from_followed: true, .. }));

    node.unfollow("follow_bob").await.unwrap();
    expect_frame(&mut frames, "UNFOLLOW").await;
    assert!(node.following().is_empty());
}

#[tokio::test]
async fn file_transfer_reassembles_out_of_order_chunks() {
    let (node, mut events, dir) = start_node("file_node").await;
    let (peer, mut frames) = FakePeer::start("file_bob", &node).await;
    peer.announce().await;
    let user_id = peer.user_id();
    let to = node.whoami().to_string();
    let token = peer.token("file");

    peer.send(&[
        ("TYPE", "FILE_OFFER"),
        ("FROM", &user_id),
        ("TO", &to),
        ("FILENAME", "blob.bin"),
        ("FILESIZE", "2500"),
        ("FILETYPE", "application/octet-stream"),
        ("FILEID", "f00d"),
        ("DESCRIPTION", "test payload"),
        ("TIMESTAMP", "1700000000"),
        ("TOKEN", &token),
    ])
    .await;
    expect_event(&mut events, "FileOffered", |e| {
        matches!(e, NetEvent::FileOffered { file_id, .. } if file_id == "f00d")
    })
    .await;

    node.accept_file("f00d").await.unwrap();

    // 2500 bytes as 1024/1024/452, delivered out of order.
    let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<&[u8]> = data.chunks(1024).collect();
    for index in [2usize, 0, 1] {
        let encoded = BASE64.encode(chunks[index]);
        let index_str = index.to_string();
        peer.send(&[
            ("TYPE", "FILE_CHUNK"),
            ("FROM", &user_id),
            ("TO", &to),
            ("FILEID", "f00d"),
            ("CHUNK_INDEX", &index_str),
            ("TOTAL_CHUNKS", "3"),
            ("CHUNK_SIZE", "1024"),
            ("TOKEN", &token),
            ("DATA", &encoded),
        ])
        .await;
    }

    let event = expect_event(&mut events, "FileSaved", |e| {
        matches!(e, NetEvent::FileSaved { file_id, .. } if file_id == "f00d")
    })
    .await;
    let NetEvent::FileSaved { path, .. } = event else { unreachable!() };
    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert!(path.starts_with(dir.path()));

    let receipt = expect_frame(&mut frames, "FILE_RECEIVED").await;
    assert_eq!(receipt.get("STATUS").unwrap(), "COMPLETE");
    assert_eq!(receipt.get("FILEID").unwrap(), "f00d");
}

#[tokio::test]
async fn chunks_for_unknown_or_rejected_files_are_dropped() {
    let (node, mut events, _dir) = start_node("drop_node").await;
    let (peer, _frames) = FakePeer::start("drop_bob", &node).await;
    peer.announce().await;
    let user_id = peer.user_id();
    let to = node.whoami().to_string();
    let token = peer.token("file");
    let encoded = BASE64.encode(b"orphan bytes");

    // No offer ever happened for this id.
    peer.send(&[
        ("TYPE", "FILE_CHUNK"),
        ("FROM", &user_id),
        ("TO", &to),
        ("FILEID", "0rphan00"),
        ("CHUNK_INDEX", "0"),
        ("TOTAL_CHUNKS", "1"),
        ("CHUNK_SIZE", "1024"),
        ("TOKEN", &token),
        ("DATA", &encoded),
    ])
    .await;
    expect_quiet(&mut events, |e| matches!(e, NetEvent::FileSaved { .. })).await;

    // Rejected offers discard all their chunks.
    peer.send(&[
        ("TYPE", "FILE_OFFER"),
        ("FROM", &user_id),
        ("TO", &to),
        ("FILENAME", "unwanted.bin"),
        ("FILESIZE", "12"),
        ("FILETYPE", "application/octet-stream"),
        ("FILEID", "rej1"),
        ("DESCRIPTION", ""),
        ("TIMESTAMP", "1700000000"),
        ("TOKEN", &token),
    ])
    .await;
    expect_event(&mut events, "FileOffered", |e| {
        matches!(e, NetEvent::FileOffered { file_id, .. } if file_id == "rej1")
    })
    .await;
    node.reject_file("rej1").unwrap();
    peer.send(&[
        ("TYPE", "FILE_CHUNK"),
        ("FROM", &user_id),
        ("TO", &to),
        ("FILEID", "rej1"),
        ("CHUNK_INDEX", "0"),
        ("TOTAL_CHUNKS", "1"),
        ("CHUNK_SIZE", "1024"),
        ("TOKEN", &token),
        ("DATA", &encoded),
    ])
    .await;
    expect_quiet(&mut events, |e| matches!(e, NetEvent::FileSaved { .. })).await;
}

#[tokio::test]
async fn outbound_file_transfer_completes_on_receipt() {
    let (node, mut events, dir) = start_node("send_node").await;
    let (peer, mut frames) = FakePeer::start("send_bob", &node).await;
    peer.announce().await;

    let path = dir.path().join("outgoing.bin");
    let data: Vec<u8> = (0..1500u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(&path, &data).unwrap();

    let file_id = node.offer_file("send_bob", &path, "here you go").await.unwrap();

    let offer = expect_frame(&mut frames, "FILE_OFFER").await;
    assert_eq!(offer.get("FILEID").unwrap(), &file_id);
    assert_eq!(offer.get("FILESIZE").unwrap(), "1500");
    assert_eq!(offer.get("FILENAME").unwrap(), "outgoing.bin");

    let mut received: Vec<(u32, Vec<u8>)> = Vec::new();
    for _ in 0..2 {
        let chunk = expect_frame(&mut frames, "FILE_CHUNK").await;
        assert_eq!(chunk.get("TOTAL_CHUNKS").unwrap(), "2");
        received.push((
            chunk.get("CHUNK_INDEX").unwrap().parse().unwrap(),
            BASE64.decode(chunk.get("DATA").unwrap()).unwrap(),
        ));
    }
    received.sort_by_key(|(i, _)| *i);
    let rebuilt: Vec<u8> = received.into_iter().flat_map(|(_, d)| d).collect();
    assert_eq!(rebuilt, data);

    let user_id = peer.user_id();
    let to = node.whoami().to_string();
    let ts = now().to_string();
    peer.send(&[
        ("TYPE", "FILE_RECEIVED"),
        ("FROM", &user_id),
        ("TO", &to),
        ("FILEID", &file_id),
        ("STATUS", "COMPLETE"),
        ("TIMESTAMP", &ts),
    ])
    .await;
    expect_event(&mut events, "FileDelivered", |e| {
        matches!(e, NetEvent::FileDelivered { status, .. } if status == "COMPLETE")
    })
    .await;
}

#[tokio::test]
async fn tictactoe_win_emits_result_and_deletes_game() {
    let (node, mut events, _dir) = start_node("ttt_node").await;
    let (peer, mut frames) = FakePeer::start("ttt_bob", &node).await;
    peer.announce().await;
    let user_id = peer.user_id();
    let to = node.whoami().to_string();
    let token = peer.token("game");

    peer.send(&[
        ("TYPE", "TICTACTOE_INVITE"),
        ("FROM", &user_id),
        ("TO", &to),
        ("GAMEID", "g77"),
        ("MESSAGE_ID", "77770000"),
        ("SYMBOL", "X"),
        ("TIMESTAMP", "1700000000"),
        ("TOKEN", &token),
    ])
    .await;
    let invited = expect_event(&mut events, "GameInvited", |e| {
        matches!(e, NetEvent::GameInvited { game_id, .. } if game_id == "g77")
    })
    .await;
    assert!(matches!(invited, NetEvent::GameInvited { your_symbol: 'O', .. }));

    // X@0, O@4, X@1, O@5, X@2 → X wins the top row. Each remote move is
    // confirmed via its BoardUpdated event before the node answers, so the
    // shared turn counter is where the next local move expects it.
    peer.send_move(&node, "g77", 1, 0, 'X', "77770001").await;
    expect_event(&mut events, "turn 2", |e| {
        matches!(e, NetEvent::BoardUpdated { next_turn: 2, .. })
    })
    .await;
    node.ttt_move("g77", 4).await.unwrap();
    peer.send_move(&node, "g77", 3, 1, 'X', "77770003").await;
    expect_event(&mut events, "turn 4", |e| {
        matches!(e, NetEvent::BoardUpdated { next_turn: 4, .. })
    })
    .await;
    node.ttt_move("g77", 5).await.unwrap();
    peer.send_move(&node, "g77", 5, 2, 'X', "77770005").await;

    let result = expect_frame(&mut frames, "TICTACTOE_RESULT").await;
    assert_eq!(result.get("RESULT").unwrap(), "X");
    assert_eq!(result.get("WINNING_LINE").unwrap(), "0,1,2");

    expect_event(&mut events, "GameOver", |e| {
        matches!(e, NetEvent::GameOver { game_id, result, .. }
            if game_id == "g77" && result == "X")
    })
    .await;
    assert!(node.game_board("g77").is_none(), "game must be deleted on RESULT");
}

#[tokio::test]
async fn tictactoe_gap_triggers_move_request_then_resyncs() {
    let (node, mut events, _dir) = start_node("sync_node").await;
    let (peer, mut frames) = FakePeer::start("sync_bob", &node).await;
    peer.announce().await;
    let user_id = peer.user_id();
    let to = node.whoami().to_string();
    let token = peer.token("game");

    peer.send(&[
        ("TYPE", "TICTACTOE_INVITE"),
        ("FROM", &user_id),
        ("TO", &to),
        ("GAMEID", "g88"),
        ("MESSAGE_ID", "88880000"),
        ("SYMBOL", "X"),
        ("TIMESTAMP", "1700000000"),
        ("TOKEN", &token),
    ])
    .await;
    expect_event(&mut events, "GameInvited", |e| {
        matches!(e, NetEvent::GameInvited { game_id, .. } if game_id == "g88")
    })
    .await;

    peer.send_move(&node, "g88", 1, 0, 'X', "88880001").await;
    expect_event(&mut events, "turn 2", |e| {
        matches!(e, NetEvent::BoardUpdated { next_turn: 2, .. })
    })
    .await;
    node.ttt_move("g88", 4).await.unwrap(); // turn 2, O@4

    // Turn 5 arrives while 3 and 4 are missing: the node must ask for the
    // gap, hold the move, and stay on turn 3.
    peer.send_move(&node, "g88", 5, 2, 'X', "88880005").await;
    let request = expect_frame(&mut frames, "TICTACTOE_MOVE_REQUEST").await;
    assert_eq!(request.get("GAMEID").unwrap(), "g88");
    assert_eq!(request.get("FROM_TURN").unwrap(), "3");
    assert_eq!(request.get("TO_TURN").unwrap(), "4");
    assert_eq!(node.game_board("g88").unwrap().1, 3);

    // Replay the gap; the held turn 5 then applies and X wins 0,1,2.
    peer.send_move(&node, "g88", 3, 1, 'X', "88880003").await;
    peer.send_move(&node, "g88", 4, 5, 'O', "88880004").await;

    let result = expect_frame(&mut frames, "TICTACTOE_RESULT").await;
    assert_eq!(result.get("RESULT").unwrap(), "X");
    assert_eq!(result.get("WINNING_LINE").unwrap(), "0,1,2");
}

#[tokio::test]
async fn unknown_game_move_asks_for_state() {
    let (node, _events, _dir) = start_node("state_node").await;
    let (peer, mut frames) = FakePeer::start("state_bob", &node).await;
    peer.announce().await;
    let user_id = peer.user_id();
    let to = node.whoami().to_string();

    peer.send_move(&node, "gXX", 1, 0, 'X', "99990001").await;
    let request = expect_frame(&mut frames, "TICTACTOE_STATE_REQUEST").await;
    assert_eq!(request.get("GAMEID").unwrap(), "gXX");

    // Answer with a snapshot; the node adopts it and can play from there.
    peer.send(&[
        ("TYPE", "TICTACTOE_STATE_RESPONSE"),
        ("FROM", &user_id),
        ("TO", &to),
        ("GAMEID", "gXX"),
        ("BOARD", "X........"),
        ("TURN", "2"),
        ("SYMBOL", "X"),
    ])
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (board, turn) = node.game_board("gXX").expect("game adopted from snapshot");
    assert_eq!(board, "X........");
    assert_eq!(turn, 2);

    node.ttt_move("gXX", 4).await.unwrap();
    let mv = expect_frame(&mut frames, "TICTACTOE_MOVE").await;
    assert_eq!(mv.get("SYMBOL").unwrap(), "O");
    assert_eq!(mv.get("TURN").unwrap(), "2");
}

#[tokio::test]
async fn groups_enforce_creator_and_membership_rules() {
    let (node, mut events, _dir) = start_node("grp_node").await;
    let (peer, mut frames) = FakePeer::start("grp_bob", &node).await;
    peer.announce().await;
    let (outsider, _outsider_frames) = FakePeer::start("grp_eve", &node).await;
    outsider.announce().await;
    let bob = peer.user_id();
    let eve = outsider.user_id();
    let me = node.whoami().to_string();
    let token = peer.token("group");

    let members = format!("{bob},{me}");
    peer.send(&[
        ("TYPE", "GROUP_CREATE"),
        ("FROM", &bob),
        ("GROUP_ID", "lunch"),
        ("GROUP_NAME", "Lunch Crew"),
        ("MEMBERS", &members),
        ("TIMESTAMP", "1700000000"),
        ("MESSAGE_ID", "abab0001"),
        ("TOKEN", &token),
    ])
    .await;
    expect_event(&mut events, "GroupCreated", |e| {
        matches!(e, NetEvent::GroupCreated { group_id, .. } if group_id == "lunch")
    })
    .await;
    assert_eq!(node.my_groups().len(), 1);

    // A non-creator's update is rejected outright.
    let eve_token = outsider.token("group");
    outsider
        .send(&[
            ("TYPE", "GROUP_UPDATE"),
            ("FROM", &eve),
            ("GROUP_ID", "lunch"),
            ("ADD", &eve),
            ("REMOVE", ""),
            ("TIMESTAMP", "1700000001"),
            ("MESSAGE_ID", "abab0002"),
            ("TOKEN", &eve_token),
        ])
        .await;
    expect_quiet(&mut events, |e| matches!(e, NetEvent::GroupUpdated { .. })).await;
    assert!(!node.group_members("lunch").contains(&eve));

    // Non-member group messages disappear silently.
    outsider
        .send(&[
            ("TYPE", "GROUP_MESSAGE"),
            ("FROM", &eve),
            ("GROUP_ID", "lunch"),
            ("CONTENT", "let me in"),
            ("TIMESTAMP", "1700000002"),
            ("MESSAGE_ID", "abab0003"),
            ("TOKEN", &eve_token),
        ])
        .await;
    expect_quiet(&mut events, |e| matches!(e, NetEvent::GroupMessageReceived { .. })).await;

    // A member's message is surfaced and ACKed.
    peer.send(&[
        ("TYPE", "GROUP_MESSAGE"),
        ("FROM", &bob),
        ("GROUP_ID", "lunch"),
        ("CONTENT", "tacos at noon"),
        ("TIMESTAMP", "1700000003"),
        ("MESSAGE_ID", "abab0004"),
        ("TOKEN", &token),
    ])
    .await;
    expect_event(&mut events, "GroupMessageReceived", |e| {
        matches!(e, NetEvent::GroupMessageReceived { content, .. } if content == "tacos at noon")
    })
    .await;

    // Our own group message fans out to the other member.
    node.group_message("lunch", "works for me").await.unwrap();
    let msg = expect_frame(&mut frames, "GROUP_MESSAGE").await;
    assert_eq!(msg.get("CONTENT").unwrap(), "works for me");

    // The creator's update lands and is applied.
    peer.send(&[
        ("TYPE", "GROUP_UPDATE"),
        ("FROM", &bob),
        ("GROUP_ID", "lunch"),
        ("ADD", &eve),
        ("REMOVE", ""),
        ("TIMESTAMP", "1700000004"),
        ("MESSAGE_ID", "abab0005"),
        ("TOKEN", &token),
    ])
    .await;
    expect_event(&mut events, "GroupUpdated", |e| {
        matches!(e, NetEvent::GroupUpdated { added, .. } if added.contains(&eve))
    })
    .await;
    assert!(node.group_members("lunch").contains(&eve));
}

#[tokio::test]
async fn ping_is_answered_with_unicast_profile() {
    let (node, _events, _dir) = start_node("ping_node").await;
    let (peer, mut frames) = FakePeer::start("ping_bob", &node).await;
    peer.announce().await;
    let user_id = peer.user_id();

    peer.send(&[("TYPE", "PING"), ("USER_ID", &user_id)]).await;
    let profile = expect_frame(&mut frames, "PROFILE").await;
    assert_eq!(profile.get("USER_ID").unwrap(), &node.whoami().to_string());
    assert!(profile.contains_key("STATUS"));
}
