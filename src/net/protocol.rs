//! The LSNP protocol engine.
//!
//! [`Network`] owns every service (peer registry, token service, ack table,
//! transfer/game/group tables) and runs the inbound pipeline:
//!
//! 1. decode and type the frame;
//! 2. drop self-echo;
//! 3. REVOKE short-circuits before any validation;
//! 4. scope + ip-bind check for token-carrying TYPEs;
//! 5. upsert the sender into the peer registry;
//! 6. run the type handler;
//! 7. surface a UI event.
//!
//! Handlers never propagate errors past the dispatcher: every failure
//! becomes a logged drop, so one malformed peer cannot take the node down.
//! Outbound traffic enters through the command surface (the `pub` methods
//! the CLI calls) and leaves via the transport's sender task.

use super::file_transfer::{
    InboundTransfer, OutboundTransfer, TransferTable, guess_mime, write_received_file,
};
use super::frame::{Frame, FrameError};
use super::groups::{GroupTable, UpdateOutcome};
use super::message::{FileChunkPayload, FileOfferPayload, LikeAction, Message, ProfilePayload};
use super::peers::{PeerEntry, PeerRegistry};
use super::presence::{LocalProfile, load_avatar, ping_message, profile_message};
use super::reliable::{AckTable, new_id, send_with_retries};
use super::tictactoe::{Game, GameTable, MoveOutcome, Symbol};
use super::token::TokenService;
use super::transport::{Target, Transport};
use super::types::{
    BURST_WINDOW_SECS, GAME_IDLE_TIMEOUT_SECS, GAME_SWEEP_INTERVAL_SECS, MAX_FRAME_SIZE,
    MAX_PROFILE_FRAME_SIZE, NetConfig, PING_INTERVAL_SECS, RECV_BUFFER_SIZE, SEND_ATTEMPTS, Scope,
};
use crate::types::{UserId, now};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("no free port in the {range} ports starting at {base}")]
    NoPort { base: u16, range: u16 },
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("no ACK from {to} after {attempts} attempts")]
    Delivery { to: String, attempts: u32 },
    #[error("{0}")]
    Command(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded inbound happenings, pushed to whatever front-end is attached.
/// The engine never prints; the event sink is its only voice.
#[derive(Debug, Clone)]
pub enum NetEvent {
    PeerDiscovered { user_id: String, display_name: String },
    ProfileUpdated { user_id: String, display_name: String, status: String, has_avatar: bool },
    Post { from: String, content: String, timestamp: u64, from_followed: bool },
    Dm { from: String, content: String, timestamp: u64 },
    FollowerAdded { user_id: String },
    FollowerRemoved { user_id: String },
    LikeReceived { from: String, post_timestamp: u64, unlike: bool },
    TokenRevoked { from: String },
    FileOffered {
        from: String,
        file_id: String,
        filename: String,
        filesize: u64,
        filetype: String,
        description: String,
    },
    FileSaved { file_id: String, filename: String, path: PathBuf, from: String },
    FileFailed { file_id: String, reason: String },
    FileDelivered { file_id: String, to: String, status: String },
    GameInvited { from: String, game_id: String, your_symbol: char },
    BoardUpdated { game_id: String, board: String, next_turn: u32 },
    GameOver { game_id: String, result: String, winning_line: String },
    GameExpired { game_id: String },
    GroupCreated { group_id: String, name: String, creator: String },
    GroupUpdated { group_id: String, added: Vec<String>, removed: Vec<String> },
    GroupMessageReceived { group_id: String, from: String, content: String },
    DeliveryFailed { to: String, message_id: String, context: String },
    /// Verbose-mode only: the reason behind a drop the terse UI never sees.
    Diagnostic { detail: String },
}

/// Cumulative counters, queryable from the command surface.
#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_invalid_token: AtomicU64,
    duplicates: AtomicU64,
    delivery_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub dropped_malformed: u64,
    pub dropped_invalid_token: u64,
    pub duplicates: u64,
    pub delivery_failures: u64,
    pub peers: usize,
    pub active_games: usize,
    pub open_inbound_transfers: usize,
    pub open_outbound_transfers: usize,
    pub revoked_tokens: usize,
}

/// Replay suppression for MESSAGE_IDs, bounded with FIFO eviction so a
/// chatty peer cannot grow it without limit.
struct BoundedIdSet {
    set: HashSet<String>,
    order: VecDeque<String>,
}

const MAX_SEEN_IDS: usize = 4096;
const ID_EVICTION_BATCH: usize = 256;

impl BoundedIdSet {
    fn new() -> Self {
        Self {
            set: HashSet::with_capacity(MAX_SEEN_IDS),
            order: VecDeque::with_capacity(MAX_SEEN_IDS),
        }
    }

    /// Returns false when the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.set.len() >= MAX_SEEN_IDS {
            for _ in 0..ID_EVICTION_BATCH {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

/// The node engine. Constructed once by [`Network::start`]; every service
/// lives behind its own lock, and compound operations stay inside single
/// service calls.
pub struct Network {
    me: Weak<Network>,
    config: NetConfig,
    user_id: UserId,
    profile: Mutex<LocalProfile>,
    transport: Transport,
    peers: PeerRegistry,
    tokens: TokenService,
    acks: AckTable,
    games: GameTable,
    transfers: TransferTable,
    groups: GroupTable,
    /// Users this node follows (feeds the POST `from_followed` flag).
    follows: Mutex<HashSet<String>>,
    /// Users following this node, learned from FOLLOW/UNFOLLOW.
    followers: Mutex<HashSet<String>>,
    /// `(poster, post_timestamp)` pairs already liked locally.
    liked: Mutex<HashSet<(String, u64)>>,
    seen_ids: Mutex<BoundedIdSet>,
    verbose: AtomicBool,
    counters: Counters,
    events: mpsc::Sender<NetEvent>,
    shutdown: watch::Sender<bool>,
}

impl Network {
    /// Bind the transport, assemble the services, and spawn the long-lived
    /// workers (listener, dispatcher, discovery burst, PING loop, game
    /// sweeper). Returns the engine handle and the event receiver the
    /// front-end drains.
    pub async fn start(config: NetConfig) -> Result<(Arc<Network>, mpsc::Receiver<NetEvent>), NetError> {
        let (transport, listener) = Transport::bind(config.port).await?;
        let user_id = UserId::new(config.username.clone(), transport.local_ip(), transport.port());
        info!("node identity {user_id}");

        let tokens = TokenService::load(&config.data_dir);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        let net = Arc::new_cyclic(|me| Network {
            me: me.clone(),
            profile: Mutex::new(LocalProfile {
                display_name: config.display_name.clone(),
                status: config.status.clone(),
                avatar: None,
            }),
            verbose: AtomicBool::new(config.verbose),
            config,
            user_id,
            transport,
            peers: PeerRegistry::new(),
            tokens,
            acks: AckTable::new(),
            games: GameTable::new(),
            transfers: TransferTable::new(),
            groups: GroupTable::new(),
            follows: Mutex::new(HashSet::new()),
            followers: Mutex::new(HashSet::new()),
            liked: Mutex::new(HashSet::new()),
            seen_ids: Mutex::new(BoundedIdSet::new()),
            counters: Counters::default(),
            events: event_tx,
            shutdown: shutdown_tx,
        });

        // Listener: one worker blocked on recvfrom, feeding a bounded queue.
        // A single dispatcher worker drains it, which keeps per-peer frames
        // in kernel arrival order.
        let (frame_tx, mut frame_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(1024);
        tokio::spawn(listen_loop(listener, frame_tx, net.shutdown.subscribe()));
        {
            let net = net.clone();
            let mut shutdown = net.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe = frame_rx.recv() => match maybe {
                            Some((raw, src)) => net.dispatch(&raw, src).await,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            });
        }

        {
            let net = net.clone();
            tokio::spawn(async move { net.presence_loop().await });
        }
        {
            let net = net.clone();
            tokio::spawn(async move { net.game_sweeper().await });
        }

        Ok((net.clone(), event_rx))
    }

    /// Flip the shutdown flag; workers exit at their next iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    // =========================================================================
    // DISPATCH PIPELINE
    // =========================================================================

    /// Transport→dispatcher seam: decode one datagram and run the pipeline.
    pub async fn handle_datagram(&self, raw: &[u8], src: SocketAddr) {
        self.dispatch(raw, src).await;
    }

    async fn dispatch(&self, raw: &[u8], src: SocketAddr) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        if raw.len() > MAX_PROFILE_FRAME_SIZE {
            self.drop_malformed(src, "oversized datagram").await;
            return;
        }
        let message = match Frame::parse(raw).and_then(|f| Message::from_frame(&f)) {
            Ok(message) => message,
            Err(e) => {
                self.drop_malformed(src, &e.to_string()).await;
                return;
            }
        };

        // ACKs carry no sender identity; they only resolve waiters.
        if let Message::Ack { message_id, .. } = &message {
            if !self.acks.resolve(message_id) {
                self.diag(format!("ACK for unknown id {message_id}")).await;
            }
            return;
        }

        let Some(sender_raw) = message.sender() else {
            self.drop_malformed(src, "frame names no sender").await;
            return;
        };
        // Canonicalise: the port embedded in the user_id wins; PROFILE may
        // supply it in a PORT field; the UDP source port is the last resort.
        let fallback_port = match &message {
            Message::Profile(p) => p.port.unwrap_or(src.port()),
            _ => src.port(),
        };
        let Some(sender) = UserId::parse(sender_raw, fallback_port) else {
            self.drop_malformed(src, "unparseable sender user_id").await;
            return;
        };

        // Self-echo: our own broadcasts come back on the subnet.
        if sender == self.user_id {
            return;
        }

        // REVOKE is honoured before any validation of the carried token.
        if let Message::Revoke { from, token } = &message {
            match self.tokens.revoke(token) {
                Ok(true) => {
                    info!("token revoked by {from}");
                    self.emit(NetEvent::TokenRevoked { from: sender.to_string() }).await;
                }
                Ok(false) => {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("failed to persist revocation: {e}"),
            }
            return;
        }

        if let Some(scope) = message.required_scope() {
            let Some(token) = message.token() else {
                self.drop_invalid_token(&sender, message.command(), "token missing").await;
                return;
            };
            if !self.tokens.validate(token, scope) {
                self.drop_invalid_token(&sender, message.command(), "expired, revoked, or wrong scope")
                    .await;
                return;
            }
            if !TokenService::bind_check(token, src.ip()) {
                self.drop_invalid_token(&sender, message.command(), "token ip does not match source")
                    .await;
                return;
            }
        }

        if self.peers.upsert(sender.clone()) {
            self.emit(NetEvent::PeerDiscovered {
                user_id: sender.to_string(),
                display_name: sender.username().to_string(),
            })
            .await;
        }

        // The error guard: a handler failure is a drop, never a crash.
        if let Err(e) = self.handle_message(&sender, message).await {
            debug!("handler error for frame from {sender}: {e}");
            self.diag(format!("handler error from {sender}: {e}")).await;
        }
    }

    async fn handle_message(&self, sender: &UserId, message: Message) -> Result<(), NetError> {
        match message {
            Message::Profile(p) => self.on_profile(sender, p).await,
            Message::Ping { .. } => self.on_ping(sender).await,
            Message::Post { content, timestamp, .. } => self.on_post(sender, content, timestamp).await,
            Message::Dm { content, timestamp, message_id, .. } => {
                self.on_dm(sender, content, timestamp, &message_id).await
            }
            Message::Follow { message_id, .. } => self.on_follow(sender, &message_id, true).await,
            Message::Unfollow { message_id, .. } => self.on_follow(sender, &message_id, false).await,
            Message::Like { post_timestamp, action, .. } => {
                self.on_like(sender, post_timestamp, action).await
            }
            Message::FileOffer(p) => self.on_file_offer(sender, p).await,
            Message::FileChunk(p) => self.on_file_chunk(sender, p).await,
            Message::FileReceived { file_id, status, .. } => {
                self.on_file_received(sender, &file_id, &status).await
            }
            Message::TictactoeInvite { game_id, message_id, symbol, .. } => {
                self.on_ttt_invite(sender, &game_id, &message_id, symbol).await
            }
            Message::TictactoeMove { game_id, message_id, position, symbol, turn, .. } => {
                self.on_ttt_move(sender, &game_id, &message_id, position, symbol, turn).await
            }
            Message::TictactoeResult { game_id, message_id, result, winning_line, .. } => {
                self.on_ttt_result(sender, &game_id, &message_id, &result, &winning_line).await
            }
            Message::TictactoeStateRequest { game_id, .. } => {
                self.on_ttt_state_request(sender, &game_id).await
            }
            Message::TictactoeStateResponse { game_id, board, turn, symbol, .. } => {
                self.on_ttt_state_response(sender, &game_id, &board, turn, symbol).await
            }
            Message::TictactoeMoveRequest { game_id, from_turn, to_turn, .. } => {
                self.on_ttt_move_request(sender, &game_id, from_turn, to_turn).await
            }
            Message::GroupCreate { group_id, group_name, members, message_id, .. } => {
                self.on_group_create(sender, &group_id, &group_name, members, &message_id).await
            }
            Message::GroupUpdate { group_id, add, remove, message_id, .. } => {
                self.on_group_update(sender, &group_id, add, remove, &message_id).await
            }
            Message::GroupMessage { group_id, content, message_id, .. } => {
                self.on_group_message(sender, &group_id, content, &message_id).await
            }
            // Handled earlier in the pipeline.
            Message::Ack { .. } | Message::Revoke { .. } => Ok(()),
        }
    }

    // =========================================================================
    // PRESENCE / SOCIAL HANDLERS
    // =========================================================================

    async fn on_profile(&self, sender: &UserId, p: ProfilePayload) -> Result<(), NetError> {
        let has_avatar = p.avatar.is_some();
        self.peers.apply_profile(sender.clone(), &p.display_name, &p.status, p.avatar);
        self.emit(NetEvent::ProfileUpdated {
            user_id: sender.to_string(),
            display_name: p.display_name,
            status: p.status,
            has_avatar,
        })
        .await;
        Ok(())
    }

    /// Any PING gets a unicast PROFILE back, aimed at the peer's listener
    /// (the port from its user_id, never the datagram's source port).
    async fn on_ping(&self, sender: &UserId) -> Result<(), NetError> {
        let msg = profile_message(&self.user_id, &self.profile.lock().unwrap().clone());
        self.send_frame(Target::Unicast(sender.addr()), &msg).await;
        self.peers.mark_profile_sent(&sender.to_string());
        self.diag(format!("PING from {sender}, replied with PROFILE")).await;
        Ok(())
    }

    async fn on_post(&self, sender: &UserId, content: String, timestamp: u64) -> Result<(), NetError> {
        let from_followed = self.follows.lock().unwrap().contains(&sender.to_string());
        self.emit(NetEvent::Post { from: sender.to_string(), content, timestamp, from_followed })
            .await;
        Ok(())
    }

    async fn on_dm(
        &self,
        sender: &UserId,
        content: String,
        timestamp: u64,
        message_id: &str,
    ) -> Result<(), NetError> {
        if !self.seen_ids.lock().unwrap().insert(message_id) {
            // Retransmission: the state is applied, only the ACK was lost.
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.send_ack(sender, message_id).await;
            return Ok(());
        }
        self.emit(NetEvent::Dm { from: sender.to_string(), content, timestamp }).await;
        self.send_ack(sender, message_id).await;
        Ok(())
    }

    async fn on_follow(
        &self,
        sender: &UserId,
        _message_id: &str,
        follow: bool,
    ) -> Result<(), NetError> {
        let key = sender.to_string();
        if follow {
            if self.followers.lock().unwrap().insert(key.clone()) {
                self.emit(NetEvent::FollowerAdded { user_id: key }).await;
            }
        } else if self.followers.lock().unwrap().remove(&key) {
            self.emit(NetEvent::FollowerRemoved { user_id: key }).await;
        }
        Ok(())
    }

    async fn on_like(
        &self,
        sender: &UserId,
        post_timestamp: u64,
        action: LikeAction,
    ) -> Result<(), NetError> {
        self.emit(NetEvent::LikeReceived {
            from: sender.to_string(),
            post_timestamp,
            unlike: action == LikeAction::Unlike,
        })
        .await;
        Ok(())
    }

    // =========================================================================
    // FILE TRANSFER HANDLERS
    // =========================================================================

    async fn on_file_offer(&self, sender: &UserId, p: FileOfferPayload) -> Result<(), NetError> {
        let transfer = InboundTransfer::new(
            p.file_id.clone(),
            sender.to_string(),
            p.filename.clone(),
            p.filesize,
            p.filetype.clone(),
        );
        if !self.transfers.offer_inbound(transfer) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.diag(format!("duplicate FILE_OFFER {}", p.file_id)).await;
            return Ok(());
        }
        self.emit(NetEvent::FileOffered {
            from: sender.to_string(),
            file_id: p.file_id,
            filename: p.filename,
            filesize: p.filesize,
            filetype: p.filetype,
            description: p.description,
        })
        .await;
        Ok(())
    }

    async fn on_file_chunk(&self, sender: &UserId, p: FileChunkPayload) -> Result<(), NetError> {
        let stored = self.transfers.with_inbound(&p.file_id, |t| {
            if t.accepted == Some(false) {
                return false;
            }
            t.store_chunk(p.chunk_index, p.total_chunks, p.data.clone())
        });
        match stored {
            None => {
                // Unknown file id: silent drop, diagnostic in verbose mode.
                self.diag(format!("chunk for unknown file {}", p.file_id)).await;
                return Ok(());
            }
            Some(false) => {
                self.diag(format!(
                    "ignored chunk {} for file {}",
                    p.chunk_index, p.file_id
                ))
                .await;
                return Ok(());
            }
            Some(true) => {}
        }
        self.try_finalize_inbound(&p.file_id, sender).await;
        Ok(())
    }

    /// Reassemble and write once a transfer is both accepted and complete,
    /// answering with FILE_RECEIVED COMPLETE or ERROR.
    async fn try_finalize_inbound(&self, file_id: &str, sender: &UserId) {
        let ready = self
            .transfers
            .with_inbound(file_id, |t| {
                if t.accepted == Some(true) && t.is_complete() {
                    t.assemble().map(|data| (t.filename.clone(), data))
                } else {
                    None
                }
            })
            .flatten();
        let Some((filename, data)) = ready else {
            return;
        };
        self.transfers.remove_inbound(file_id);

        match write_received_file(&self.config.download_dir, &filename, &data) {
            Ok(path) => {
                info!("file {filename} ({} bytes) saved to {}", data.len(), path.display());
                self.send_file_receipt(sender, file_id, "COMPLETE").await;
                self.emit(NetEvent::FileSaved {
                    file_id: file_id.to_string(),
                    filename,
                    path,
                    from: sender.to_string(),
                })
                .await;
            }
            Err(e) => {
                warn!("failed to write {filename}: {e}");
                self.send_file_receipt(sender, file_id, "ERROR").await;
                self.emit(NetEvent::FileFailed {
                    file_id: file_id.to_string(),
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn send_file_receipt(&self, to: &UserId, file_id: &str, status: &str) {
        let msg = Message::FileReceived {
            from: self.user_id.to_string(),
            to: to.to_string(),
            file_id: file_id.to_string(),
            status: status.to_string(),
            timestamp: now(),
        };
        self.send_frame(Target::Unicast(to.addr()), &msg).await;
    }

    async fn on_file_received(
        &self,
        sender: &UserId,
        file_id: &str,
        status: &str,
    ) -> Result<(), NetError> {
        match self.transfers.finish_outbound(file_id) {
            Some(t) => {
                self.emit(NetEvent::FileDelivered {
                    file_id: t.file_id,
                    to: sender.to_string(),
                    status: status.to_string(),
                })
                .await;
            }
            None => self.diag(format!("FILE_RECEIVED for unknown transfer {file_id}")).await,
        }
        Ok(())
    }

    // =========================================================================
    // TIC-TAC-TOE HANDLERS
    // =========================================================================

    async fn on_ttt_invite(
        &self,
        sender: &UserId,
        game_id: &str,
        message_id: &str,
        symbol: char,
    ) -> Result<(), NetError> {
        if self.games.contains(game_id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.send_ack(sender, message_id).await;
            return Ok(());
        }
        let Some(inviter_symbol) = Symbol::from_char(symbol) else {
            return Err(NetError::Command(format!("bad symbol {symbol}")));
        };
        let game = Game::new(&sender.to_string(), inviter_symbol, &self.user_id.to_string());
        self.games.insert(game_id, game);
        self.send_ack(sender, message_id).await;
        self.emit(NetEvent::GameInvited {
            from: sender.to_string(),
            game_id: game_id.to_string(),
            your_symbol: inviter_symbol.other().as_char(),
        })
        .await;
        Ok(())
    }

    async fn on_ttt_move(
        &self,
        sender: &UserId,
        game_id: &str,
        message_id: &str,
        position: u8,
        symbol: char,
        turn: u32,
    ) -> Result<(), NetError> {
        let Some(symbol) = Symbol::from_char(symbol) else {
            return Err(NetError::Command(format!("bad symbol {symbol}")));
        };
        if !self.games.contains(game_id) {
            // Unknown game: ask the sender for a snapshot and drop the move;
            // it will come back through the resync path.
            let msg = Message::TictactoeStateRequest {
                from: self.user_id.to_string(),
                to: sender.to_string(),
                game_id: game_id.to_string(),
            };
            self.send_frame(Target::Unicast(sender.addr()), &msg).await;
            self.diag(format!("move for unknown game {game_id}, requested state")).await;
            return Ok(());
        }

        let sender_key = sender.to_string();
        let outcome = self
            .games
            .with_game(game_id, |g| {
                let outcome = g.receive_move(&sender_key, turn, position, symbol);
                (outcome, g.board_string(), g.turn)
            });
        let Some((outcome, board, next_turn)) = outcome else {
            return Ok(());
        };

        match outcome {
            MoveOutcome::Applied { finished } => {
                self.send_ack(sender, message_id).await;
                self.emit(NetEvent::BoardUpdated {
                    game_id: game_id.to_string(),
                    board,
                    next_turn,
                })
                .await;
                if let Some((result, line)) = finished {
                    self.spawn_game_result(game_id, sender.clone(), result, line);
                }
            }
            MoveOutcome::Duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                self.send_ack(sender, message_id).await;
            }
            MoveOutcome::Held { expected } => {
                self.send_ack(sender, message_id).await;
                let msg = Message::TictactoeMoveRequest {
                    from: self.user_id.to_string(),
                    to: sender.to_string(),
                    game_id: game_id.to_string(),
                    from_turn: expected,
                    to_turn: turn - 1,
                };
                self.send_frame(Target::Unicast(sender.addr()), &msg).await;
                self.diag(format!(
                    "held future move (turn {turn}, expected {expected}) for {game_id}"
                ))
                .await;
            }
            MoveOutcome::Rejected(reason) => {
                self.diag(format!("rejected move for {game_id}: {reason}")).await;
            }
        }
        Ok(())
    }

    /// Deliver TICTACTOE_RESULT off the dispatcher worker. The reliable
    /// wait must not run inline here: the ACK it waits for arrives through
    /// this very worker.
    fn spawn_game_result(&self, game_id: &str, opponent: UserId, result: String, line: String) {
        let Some(net) = self.me.upgrade() else {
            return;
        };
        let game_id = game_id.to_string();
        tokio::spawn(async move {
            net.deliver_game_result(&game_id, &opponent, &result, &line).await;
        });
    }

    /// Send the RESULT, then delete the game on both success and failure.
    /// A peer that never hears the RESULT falls to its idle sweeper.
    async fn deliver_game_result(&self, game_id: &str, opponent: &UserId, result: &str, line: &str) {
        let symbol = self
            .games
            .with_game(game_id, |g| g.symbol_of(&self.user_id.to_string()))
            .flatten()
            .unwrap_or(Symbol::X);
        let message_id = new_id();
        let msg = Message::TictactoeResult {
            from: self.user_id.to_string(),
            to: opponent.to_string(),
            game_id: game_id.to_string(),
            message_id: message_id.clone(),
            result: result.to_string(),
            symbol: symbol.as_char(),
            winning_line: line.to_string(),
            timestamp: now(),
            token: self.token_for(Scope::Game),
        };
        if !self.send_reliable(opponent, &message_id, &msg, "game result").await {
            self.emit(NetEvent::DeliveryFailed {
                to: opponent.to_string(),
                message_id,
                context: format!("result for game {game_id}"),
            })
            .await;
        }
        // The opponent may have detected the same ending and already closed
        // the game from their RESULT; only the side that removes it emits.
        if self.games.remove(game_id) {
            self.emit(NetEvent::GameOver {
                game_id: game_id.to_string(),
                result: result.to_string(),
                winning_line: line.to_string(),
            })
            .await;
        }
    }

    async fn on_ttt_result(
        &self,
        sender: &UserId,
        game_id: &str,
        message_id: &str,
        result: &str,
        winning_line: &str,
    ) -> Result<(), NetError> {
        // ACK regardless: the sender retries until someone answers, and a
        // result for a game we already closed still deserves silence after
        // one ACK.
        self.send_ack(sender, message_id).await;
        if self.games.remove(game_id) {
            self.emit(NetEvent::GameOver {
                game_id: game_id.to_string(),
                result: result.to_string(),
                winning_line: winning_line.to_string(),
            })
            .await;
        } else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.diag(format!("RESULT for unknown game {game_id}")).await;
        }
        Ok(())
    }

    async fn on_ttt_state_request(&self, sender: &UserId, game_id: &str) -> Result<(), NetError> {
        let snapshot = self.games.with_game(game_id, |g| {
            (g.board_string(), g.turn, g.symbol_of(&self.user_id.to_string()))
        });
        let Some((board, turn, Some(symbol))) = snapshot else {
            self.diag(format!("state request for unknown game {game_id}")).await;
            return Ok(());
        };
        let msg = Message::TictactoeStateResponse {
            from: self.user_id.to_string(),
            to: sender.to_string(),
            game_id: game_id.to_string(),
            board,
            turn,
            symbol: symbol.as_char(),
        };
        self.send_frame(Target::Unicast(sender.addr()), &msg).await;
        Ok(())
    }

    async fn on_ttt_state_response(
        &self,
        sender: &UserId,
        game_id: &str,
        board: &str,
        turn: u32,
        symbol: char,
    ) -> Result<(), NetError> {
        let Some(peer_symbol) = Symbol::from_char(symbol) else {
            return Err(NetError::Command(format!("bad symbol {symbol}")));
        };
        let behind = match self.games.with_game(game_id, |g| g.turn) {
            Some(our_turn) => turn > our_turn,
            None => true,
        };
        if !behind {
            self.diag(format!("state response for {game_id} is not ahead, ignored")).await;
            return Ok(());
        }
        let Some(game) = Game::from_snapshot(
            board,
            turn,
            &sender.to_string(),
            peer_symbol,
            &self.user_id.to_string(),
        ) else {
            return Err(NetError::Command("unparseable board snapshot".to_string()));
        };
        let board = game.board_string();
        let next_turn = game.turn;
        self.games.insert(game_id, game);
        self.emit(NetEvent::BoardUpdated {
            game_id: game_id.to_string(),
            board,
            next_turn,
        })
        .await;
        Ok(())
    }

    /// Replay the requested turn range from history as fresh MOVE frames.
    async fn on_ttt_move_request(
        &self,
        sender: &UserId,
        game_id: &str,
        from_turn: u32,
        to_turn: u32,
    ) -> Result<(), NetError> {
        let moves = self
            .games
            .with_game(game_id, |g| g.moves_in_range(from_turn, to_turn))
            .unwrap_or_default();
        if moves.is_empty() {
            self.diag(format!("no history for {game_id} turns {from_turn}..{to_turn}")).await;
            return Ok(());
        }
        for m in moves {
            let msg = Message::TictactoeMove {
                from: self.user_id.to_string(),
                to: sender.to_string(),
                game_id: game_id.to_string(),
                message_id: new_id(),
                position: m.position,
                symbol: m.symbol.as_char(),
                turn: m.turn,
                token: self.token_for(Scope::Game),
            };
            self.send_frame(Target::Unicast(sender.addr()), &msg).await;
        }
        Ok(())
    }

    // =========================================================================
    // GROUP HANDLERS
    // =========================================================================

    async fn on_group_create(
        &self,
        sender: &UserId,
        group_id: &str,
        group_name: &str,
        members: Vec<String>,
        message_id: &str,
    ) -> Result<(), NetError> {
        if self.groups.create(group_id, group_name, &sender.to_string(), &members) {
            self.emit(NetEvent::GroupCreated {
                group_id: group_id.to_string(),
                name: group_name.to_string(),
                creator: sender.to_string(),
            })
            .await;
        } else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        self.send_ack(sender, message_id).await;
        Ok(())
    }

    async fn on_group_update(
        &self,
        sender: &UserId,
        group_id: &str,
        add: Vec<String>,
        remove: Vec<String>,
        message_id: &str,
    ) -> Result<(), NetError> {
        match self.groups.update(group_id, &sender.to_string(), &add, &remove) {
            UpdateOutcome::Applied { added, removed } => {
                self.send_ack(sender, message_id).await;
                self.emit(NetEvent::GroupUpdated {
                    group_id: group_id.to_string(),
                    added,
                    removed,
                })
                .await;
            }
            UpdateOutcome::NotCreator => {
                self.diag(format!("GROUP_UPDATE for {group_id} from non-creator {sender}")).await;
            }
            UpdateOutcome::UnknownGroup => {
                self.diag(format!("GROUP_UPDATE for unknown group {group_id}")).await;
            }
        }
        Ok(())
    }

    async fn on_group_message(
        &self,
        sender: &UserId,
        group_id: &str,
        content: String,
        message_id: &str,
    ) -> Result<(), NetError> {
        if !self.groups.is_member(group_id, &sender.to_string()) {
            // Non-members are dropped without a reply.
            self.diag(format!("group message from non-member {sender} to {group_id}")).await;
            return Ok(());
        }
        if !self.seen_ids.lock().unwrap().insert(message_id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.send_ack(sender, message_id).await;
            return Ok(());
        }
        self.send_ack(sender, message_id).await;
        self.emit(NetEvent::GroupMessageReceived {
            group_id: group_id.to_string(),
            from: sender.to_string(),
            content,
        })
        .await;
        Ok(())
    }

    // =========================================================================
    // COMMAND SURFACE
    // =========================================================================

    pub fn whoami(&self) -> UserId {
        self.user_id.clone()
    }

    pub fn peer_list(&self) -> Vec<PeerEntry> {
        self.peers.list(Some(&self.user_id))
    }

    pub fn remove_peer(&self, user_id: &str) -> bool {
        self.peers.remove(user_id)
    }

    pub fn set_verbose(&self, on: bool) {
        self.verbose.store(on, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> NetStats {
        let (open_in, open_out) = self.transfers.open_counts();
        NetStats {
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            dropped_malformed: self.counters.dropped_malformed.load(Ordering::Relaxed),
            dropped_invalid_token: self.counters.dropped_invalid_token.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
            peers: self.peers.stats().total,
            active_games: self.games.count(),
            open_inbound_transfers: open_in,
            open_outbound_transfers: open_out,
            revoked_tokens: self.tokens.revoked_count(),
        }
    }

    /// Broadcast a POST to the subnet.
    pub async fn post(&self, content: &str) -> Result<(), NetError> {
        let msg = Message::Post {
            user_id: self.user_id.to_string(),
            content: content.to_string(),
            ttl: Scope::Broadcast.default_ttl(),
            message_id: new_id(),
            timestamp: now(),
            token: self.token_for(Scope::Broadcast),
        };
        self.send_frame(Target::Broadcast, &msg).await;
        Ok(())
    }

    /// Reliable direct message. Blocks the calling task through the retry
    /// schedule; an error means every transmission went unacknowledged.
    pub async fn dm(&self, target: &str, content: &str) -> Result<(), NetError> {
        let peer = self.require_peer(target)?;
        let message_id = new_id();
        let msg = Message::Dm {
            from: self.user_id.to_string(),
            to: peer.user_id.to_string(),
            content: content.to_string(),
            timestamp: now(),
            message_id: message_id.clone(),
            token: self.token_for(Scope::Chat),
        };
        if self.send_reliable(&peer.user_id, &message_id, &msg, "dm").await {
            Ok(())
        } else {
            self.emit(NetEvent::DeliveryFailed {
                to: peer.user_id.to_string(),
                message_id,
                context: "dm".to_string(),
            })
            .await;
            Err(NetError::Delivery { to: peer.user_id.to_string(), attempts: SEND_ATTEMPTS })
        }
    }

    pub async fn follow(&self, target: &str) -> Result<(), NetError> {
        self.send_follow_frame(target, true).await
    }

    pub async fn unfollow(&self, target: &str) -> Result<(), NetError> {
        self.send_follow_frame(target, false).await
    }

    async fn send_follow_frame(&self, target: &str, follow: bool) -> Result<(), NetError> {
        let peer = self.require_peer(target)?;
        let peer_key = peer.user_id.to_string();
        {
            let mut follows = self.follows.lock().unwrap();
            let changed = if follow {
                follows.insert(peer_key.clone())
            } else {
                follows.remove(&peer_key)
            };
            if !changed {
                return Err(NetError::Command(if follow {
                    format!("already following {peer_key}")
                } else {
                    format!("not following {peer_key}")
                }));
            }
        }
        let common = (
            self.user_id.to_string(),
            peer_key,
            new_id(),
            now(),
            self.token_for(Scope::Follow),
        );
        let msg = if follow {
            Message::Follow {
                from: common.0,
                to: common.1,
                message_id: common.2,
                timestamp: common.3,
                token: common.4,
            }
        } else {
            Message::Unfollow {
                from: common.0,
                to: common.1,
                message_id: common.2,
                timestamp: common.3,
                token: common.4,
            }
        };
        self.send_frame(Target::Unicast(peer.user_id.addr()), &msg).await;
        Ok(())
    }

    /// Users this node currently follows.
    pub fn following(&self) -> Vec<String> {
        let mut list: Vec<String> = self.follows.lock().unwrap().iter().cloned().collect();
        list.sort();
        list
    }

    /// LIKE (or UNLIKE) a post, identified by poster and post timestamp.
    /// The liked-set keeps a node from liking the same post twice.
    pub async fn like(&self, target: &str, post_timestamp: u64, unlike: bool) -> Result<(), NetError> {
        let peer = self.require_peer(target)?;
        let key = (peer.user_id.to_string(), post_timestamp);
        {
            let mut liked = self.liked.lock().unwrap();
            let changed = if unlike { liked.remove(&key) } else { liked.insert(key.clone()) };
            if !changed {
                return Err(NetError::Command(if unlike {
                    "you have not liked that post".to_string()
                } else {
                    "already liked that post".to_string()
                }));
            }
        }
        let msg = Message::Like {
            from: self.user_id.to_string(),
            to: peer.user_id.to_string(),
            post_timestamp,
            action: if unlike { LikeAction::Unlike } else { LikeAction::Like },
            timestamp: now(),
            token: self.token_for(Scope::Broadcast),
        };
        self.send_frame(Target::Unicast(peer.user_id.addr()), &msg).await;
        Ok(())
    }

    /// One-shot PROFILE broadcast outside the periodic loops.
    pub async fn hello(&self) {
        let msg = profile_message(&self.user_id, &self.profile.lock().unwrap().clone());
        self.send_frame(Target::Broadcast, &msg).await;
    }

    pub async fn set_status(&self, status: &str) {
        self.profile.lock().unwrap().status = status.to_string();
        self.hello().await;
    }

    /// Load an avatar from disk and advertise it immediately.
    pub async fn set_avatar(&self, path: &Path) -> Result<(), NetError> {
        let avatar = load_avatar(path)?;
        self.profile.lock().unwrap().avatar = Some(avatar);
        self.hello().await;
        Ok(())
    }

    /// Broadcast a REVOKE for a token this node minted earlier, and stop
    /// honouring it locally too.
    pub async fn revoke_token(&self, token: &str) -> Result<(), NetError> {
        self.tokens.revoke(token)?;
        let msg = Message::Revoke {
            from: self.user_id.to_string(),
            token: token.to_string(),
        };
        self.send_frame(Target::Broadcast, &msg).await;
        Ok(())
    }

    // ---- file transfer commands ----

    /// Offer a file and stream its chunks. Returns the FILEID; completion
    /// is signalled later by a FileDelivered event when the receiver's
    /// FILE_RECEIVED lands.
    pub async fn offer_file(
        &self,
        target: &str,
        path: &Path,
        description: &str,
    ) -> Result<String, NetError> {
        let peer = self.require_peer(target)?;
        let data = std::fs::read(path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file.bin")
            .to_string();
        let file_id = new_id();
        // An empty file still ships one (empty) chunk so the receiver can
        // reach the complete state.
        let chunks: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(super::types::CHUNK_RAW_SIZE).map(<[u8]>::to_vec).collect()
        };
        let total_chunks = chunks.len() as u32;
        let token = self.token_for(Scope::File);

        let offer = Message::FileOffer(FileOfferPayload {
            from: self.user_id.to_string(),
            to: peer.user_id.to_string(),
            filename: filename.clone(),
            filesize: data.len() as u64,
            filetype: guess_mime(path).to_string(),
            file_id: file_id.clone(),
            description: description.to_string(),
            timestamp: now(),
            token: token.clone(),
        });
        self.send_frame(Target::Unicast(peer.user_id.addr()), &offer).await;

        self.transfers.start_outbound(OutboundTransfer {
            file_id: file_id.clone(),
            to: peer.user_id.to_string(),
            filename,
            filesize: data.len() as u64,
            total_chunks,
        });

        // No pacing or ordering contract between chunks; the receiver's
        // index map absorbs whatever order the network produces.
        for (index, chunk) in chunks.iter().enumerate() {
            let msg = Message::FileChunk(FileChunkPayload {
                from: self.user_id.to_string(),
                to: peer.user_id.to_string(),
                file_id: file_id.clone(),
                chunk_index: index as u32,
                total_chunks,
                chunk_size: super::types::CHUNK_RAW_SIZE as u32,
                token: token.clone(),
                data: chunk.clone(),
            });
            self.send_frame(Target::Unicast(peer.user_id.addr()), &msg).await;
        }
        info!("offered {} ({} chunks) to {}", file_id, total_chunks, peer.user_id);
        Ok(file_id)
    }

    /// Accept a pending inbound offer. If the chunks already arrived the
    /// file is written right away.
    pub async fn accept_file(&self, file_id: &str) -> Result<(), NetError> {
        let sender = self
            .transfers
            .with_inbound(file_id, |t| t.from.clone())
            .ok_or_else(|| NetError::Command(format!("no pending offer {file_id}")))?;
        let _ = self.transfers.decide_inbound(file_id, true);
        let Some(sender) = UserId::parse(&sender, super::types::DEFAULT_PORT) else {
            return Err(NetError::UnknownPeer(sender));
        };
        self.try_finalize_inbound(file_id, &sender).await;
        Ok(())
    }

    /// Reject a pending inbound offer; all current and future chunks for
    /// the id are discarded.
    pub fn reject_file(&self, file_id: &str) -> Result<(), NetError> {
        self.transfers
            .decide_inbound(file_id, false)
            .ok_or_else(|| NetError::Command(format!("no pending offer {file_id}")))?;
        Ok(())
    }

    // ---- tic-tac-toe commands ----

    /// Invite a peer, choosing this node's symbol. Returns the GAMEID.
    pub async fn ttt_invite(&self, target: &str, symbol: char) -> Result<String, NetError> {
        let Some(symbol) = Symbol::from_char(symbol.to_ascii_uppercase()) else {
            return Err(NetError::Command("symbol must be X or O".to_string()));
        };
        let peer = self.require_peer(target)?;
        let game_id = format!("g{}", new_id());
        self.games.insert(
            &game_id,
            Game::new(&self.user_id.to_string(), symbol, &peer.user_id.to_string()),
        );
        let msg = Message::TictactoeInvite {
            from: self.user_id.to_string(),
            to: peer.user_id.to_string(),
            game_id: game_id.clone(),
            message_id: new_id(),
            symbol: symbol.as_char(),
            timestamp: now(),
            token: self.token_for(Scope::Game),
        };
        self.send_frame(Target::Unicast(peer.user_id.addr()), &msg).await;
        Ok(game_id)
    }

    /// Play a position. The move is applied tentatively, sent reliably,
    /// and un-played if every transmission goes unacknowledged.
    pub async fn ttt_move(&self, game_id: &str, position: u8) -> Result<(), NetError> {
        let me = self.user_id.to_string();
        let played = self
            .games
            .with_game(game_id, |g| {
                let turn = g.play_local(&me, position)?;
                let opponent = g
                    .opponent_of(&me)
                    .map(str::to_string)
                    .ok_or("game has no opponent")?;
                Ok::<_, &'static str>((turn, g.symbol_of(&me), opponent, g.board_string(), g.turn))
            })
            .ok_or_else(|| NetError::Command(format!("unknown game {game_id}")))?
            .map_err(|e| NetError::Command(e.to_string()))?;
        let (turn, symbol, opponent, board, next_turn) = played;
        let Some(symbol) = symbol else {
            return Err(NetError::Command("you are not in this game".to_string()));
        };
        let Some(opponent_id) = UserId::parse(&opponent, super::types::DEFAULT_PORT) else {
            return Err(NetError::UnknownPeer(opponent));
        };

        let message_id = new_id();
        let msg = Message::TictactoeMove {
            from: me.clone(),
            to: opponent.clone(),
            game_id: game_id.to_string(),
            message_id: message_id.clone(),
            position,
            symbol: symbol.as_char(),
            turn,
            token: self.token_for(Scope::Game),
        };

        if !self.send_reliable(&opponent_id, &message_id, &msg, "move").await {
            // Revert the tentative move so the local board matches what the
            // opponent actually saw.
            self.games.with_game(game_id, |g| g.revert_local(turn, position));
            self.emit(NetEvent::DeliveryFailed {
                to: opponent,
                message_id,
                context: format!("move in game {game_id}"),
            })
            .await;
            return Err(NetError::Delivery { to: opponent_id.to_string(), attempts: SEND_ATTEMPTS });
        }

        self.emit(NetEvent::BoardUpdated {
            game_id: game_id.to_string(),
            board,
            next_turn,
        })
        .await;

        let finished = self
            .games
            .with_game(game_id, |g| {
                g.winner().map(|(r, line)| {
                    (
                        r.as_str().to_string(),
                        line.map(|[a, b, c]| format!("{a},{b},{c}")).unwrap_or_default(),
                    )
                })
            })
            .flatten();
        if let Some((result, line)) = finished {
            self.deliver_game_result(game_id, &opponent_id, &result, &line).await;
        }
        Ok(())
    }

    /// Current board snapshot for the front-end.
    pub fn game_board(&self, game_id: &str) -> Option<(String, u32)> {
        self.games.with_game(game_id, |g| (g.board_string(), g.turn))
    }

    // ---- group commands ----

    /// Create a group and push GROUP_CREATE to every member reliably.
    pub async fn create_group(
        &self,
        group_id: &str,
        name: &str,
        member_targets: &[String],
    ) -> Result<(), NetError> {
        let mut members = Vec::new();
        for target in member_targets {
            members.push(self.require_peer(target)?.user_id.to_string());
        }
        if !self.groups.create(group_id, name, &self.user_id.to_string(), &members) {
            return Err(NetError::Command(format!("group {group_id} already exists")));
        }
        let me = self.user_id.to_string();
        let recipients = self.groups.other_members(group_id, &me);
        let all_members: Vec<String> = {
            let mut m = members.clone();
            m.push(me.clone());
            m.sort();
            m.dedup();
            m
        };
        self.fan_out_reliable(&recipients, "group create", |_to, message_id| Message::GroupCreate {
            from: me.clone(),
            group_id: group_id.to_string(),
            group_name: name.to_string(),
            members: all_members.clone(),
            timestamp: now(),
            message_id,
            token: self.token_for(Scope::Group),
        })
        .await;
        Ok(())
    }

    /// Patch membership (creator only) and push GROUP_UPDATE to the
    /// resulting member set.
    pub async fn update_group(
        &self,
        group_id: &str,
        add_targets: &[String],
        remove_targets: &[String],
    ) -> Result<(), NetError> {
        let me = self.user_id.to_string();
        let mut add = Vec::new();
        for target in add_targets {
            add.push(self.require_peer(target)?.user_id.to_string());
        }
        let mut remove = Vec::new();
        for target in remove_targets {
            let resolved = self
                .require_peer(target)
                .map(|p| p.user_id.to_string())
                .unwrap_or_else(|_| target.clone());
            remove.push(resolved);
        }
        match self.groups.update(group_id, &me, &add, &remove) {
            UpdateOutcome::UnknownGroup => {
                return Err(NetError::Command(format!("unknown group {group_id}")));
            }
            UpdateOutcome::NotCreator => {
                return Err(NetError::Command("only the creator may update a group".to_string()));
            }
            UpdateOutcome::Applied { .. } => {}
        }
        // Removed members also hear the update so they can drop the group.
        let mut recipients = self.groups.other_members(group_id, &me);
        for removed in &remove {
            if !recipients.contains(removed) && removed != &me {
                recipients.push(removed.clone());
            }
        }
        self.fan_out_reliable(&recipients, "group update", |_to, message_id| Message::GroupUpdate {
            from: me.clone(),
            group_id: group_id.to_string(),
            add: add.clone(),
            remove: remove.clone(),
            timestamp: now(),
            message_id,
            token: self.token_for(Scope::Group),
        })
        .await;
        Ok(())
    }

    /// Send a message to every other member of a group this node is in.
    pub async fn group_message(&self, group_id: &str, content: &str) -> Result<(), NetError> {
        let me = self.user_id.to_string();
        if !self.groups.is_member(group_id, &me) {
            return Err(NetError::Command(format!("you are not a member of {group_id}")));
        }
        let recipients = self.groups.other_members(group_id, &me);
        self.fan_out_reliable(&recipients, "group message", |_to, message_id| {
            Message::GroupMessage {
                from: me.clone(),
                group_id: group_id.to_string(),
                content: content.to_string(),
                timestamp: now(),
                message_id,
                token: self.token_for(Scope::Group),
            }
        })
        .await;
        Ok(())
    }

    pub fn my_groups(&self) -> Vec<(String, String, usize)> {
        self.groups.groups_of(&self.user_id.to_string())
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .groups
            .get(group_id)
            .map(|g| g.members.into_iter().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn token_for(&self, scope: Scope) -> String {
        self.tokens.issue(&self.user_id, scope, None)
    }

    /// Resolve a command target (username or full id) to a peer with an
    /// address. An unregistered but fully qualified `user@ip:port` id is
    /// accepted as-is; anything else is [`NetError::UnknownPeer`].
    fn require_peer(&self, target: &str) -> Result<PeerEntry, NetError> {
        if let Some(entry) = self.peers.resolve(target) {
            return Ok(entry);
        }
        if target.contains('@') {
            if let Some(user_id) = UserId::parse(target, super::types::DEFAULT_PORT) {
                return Ok(PeerEntry {
                    display_name: user_id.username().to_string(),
                    user_id,
                    status: String::new(),
                    avatar: None,
                    last_seen: 0,
                    last_profile_sent: 0,
                });
            }
        }
        Err(NetError::UnknownPeer(target.to_string()))
    }

    /// Serialise and enqueue one frame, enforcing the size contract.
    async fn send_frame(&self, target: Target, msg: &Message) -> bool {
        let payload = msg.to_frame().to_bytes();
        let limit = match msg {
            Message::Profile(_) => MAX_PROFILE_FRAME_SIZE,
            _ => MAX_FRAME_SIZE,
        };
        if payload.len() > limit {
            warn!("refusing to send oversized {} frame ({} bytes)", msg.command(), payload.len());
            return false;
        }
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.transport.send(target, payload).await
    }

    async fn send_reliable(
        &self,
        to: &UserId,
        message_id: &str,
        msg: &Message,
        context: &str,
    ) -> bool {
        let payload = msg.to_frame().to_bytes();
        if payload.len() > MAX_FRAME_SIZE {
            warn!("refusing to send oversized {} frame", msg.command());
            return false;
        }
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        let ok = send_with_retries(&self.transport, &self.acks, to.addr(), message_id, payload).await;
        if !ok {
            self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
            debug!("{context} to {to} failed");
        }
        ok
    }

    /// Reliable unicast to a set of member ids, concurrently, one fresh
    /// MESSAGE_ID per recipient. Failures surface individually and do not
    /// stop the rest of the fan-out.
    async fn fan_out_reliable(
        &self,
        recipients: &[String],
        context: &str,
        build: impl Fn(&str, String) -> Message,
    ) {
        let mut handles = Vec::new();
        for recipient in recipients {
            let Some(user_id) = UserId::parse(recipient, super::types::DEFAULT_PORT) else {
                warn!("skipping unaddressable group member {recipient}");
                continue;
            };
            let message_id = new_id();
            let msg = build(recipient, message_id.clone());
            let Some(net) = self.me.upgrade() else {
                return;
            };
            let context = context.to_string();
            handles.push(tokio::spawn(async move {
                if !net.send_reliable(&user_id, &message_id, &msg, &context).await {
                    net.emit(NetEvent::DeliveryFailed {
                        to: user_id.to_string(),
                        message_id,
                        context,
                    })
                    .await;
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn send_ack(&self, to: &UserId, message_id: &str) {
        let msg = Message::Ack {
            message_id: message_id.to_string(),
            status: "RECEIVED".to_string(),
        };
        self.send_frame(Target::Unicast(to.addr()), &msg).await;
    }

    async fn emit(&self, event: NetEvent) {
        let _ = self.events.send(event).await;
    }

    async fn diag(&self, detail: String) {
        debug!("{detail}");
        if self.is_verbose() {
            self.emit(NetEvent::Diagnostic { detail }).await;
        }
    }

    async fn drop_malformed(&self, src: SocketAddr, reason: &str) {
        self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
        self.diag(format!("malformed frame from {src}: {reason}")).await;
    }

    async fn drop_invalid_token(&self, sender: &UserId, command: &str, reason: &str) {
        self.counters.dropped_invalid_token.fetch_add(1, Ordering::Relaxed);
        self.diag(format!("dropped {command} from {sender}: {reason}")).await;
    }

    // =========================================================================
    // PERIODIC WORKERS
    // =========================================================================

    /// Initial burst (PROFILE+PING every second for the first five), then
    /// steady-state PING on the long interval. PING replies come back as
    /// unicast PROFILEs and fill the registry.
    async fn presence_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        for _ in 0..BURST_WINDOW_SECS {
            self.hello().await;
            self.send_frame(Target::Broadcast, &ping_message(&self.user_id)).await;
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                _ = shutdown.changed() => return,
            }
        }
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.send_frame(Target::Broadcast, &ping_message(&self.user_id)).await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Garbage-collect idle games with a user-visible notice.
    async fn game_sweeper(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(GAME_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for game_id in self.games.sweep_idle(GAME_IDLE_TIMEOUT_SECS) {
                        info!("game {game_id} timed out after {GAME_IDLE_TIMEOUT_SECS}s idle");
                        self.emit(NetEvent::GameExpired { game_id }).await;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

async fn listen_loop(
    listener: UdpSocket,
    frames: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = listener.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    if frames.send((buf[..len].to_vec(), src)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("listener recv error: {e}");
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}
