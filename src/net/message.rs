//! The closed set of LSNP message types.
//!
//! The codec ([`super::frame`]) yields an untyped key/value [`Frame`]; this
//! module narrows it into one variant per wire TYPE with the fields that
//! TYPE requires, and builds frames back for the outbound path. The
//! dispatcher only ever matches on [`Message`], never on raw frames.

use super::frame::{Frame, FrameError};
use super::types::Scope;
use crate::types::Avatar;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// PROFILE payload. `user_id` may be partial on the wire; the dispatcher
/// canonicalises it with the PORT field (or the UDP source port) as the
/// fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePayload {
    pub user_id: String,
    pub display_name: String,
    pub status: String,
    pub port: Option<u16>,
    pub avatar: Option<Avatar>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOfferPayload {
    pub from: String,
    pub to: String,
    pub filename: String,
    pub filesize: u64,
    pub filetype: String,
    pub file_id: String,
    pub description: String,
    pub timestamp: u64,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunkPayload {
    pub from: String,
    pub to: String,
    pub file_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub token: String,
    /// Raw bytes, already base64-decoded.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeAction {
    Like,
    Unlike,
}

impl LikeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LikeAction::Like => "LIKE",
            LikeAction::Unlike => "UNLIKE",
        }
    }
}

/// One variant per LSNP wire TYPE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Profile(ProfilePayload),
    Ping {
        user_id: String,
    },
    Post {
        user_id: String,
        content: String,
        ttl: u64,
        message_id: String,
        timestamp: u64,
        token: String,
    },
    Dm {
        from: String,
        to: String,
        content: String,
        timestamp: u64,
        message_id: String,
        token: String,
    },
    Ack {
        message_id: String,
        status: String,
    },
    Follow {
        from: String,
        to: String,
        message_id: String,
        timestamp: u64,
        token: String,
    },
    Unfollow {
        from: String,
        to: String,
        message_id: String,
        timestamp: u64,
        token: String,
    },
    Like {
        from: String,
        to: String,
        post_timestamp: u64,
        action: LikeAction,
        timestamp: u64,
        token: String,
    },
    Revoke {
        from: String,
        token: String,
    },
    FileOffer(FileOfferPayload),
    FileChunk(FileChunkPayload),
    FileReceived {
        from: String,
        to: String,
        file_id: String,
        status: String,
        timestamp: u64,
    },
    TictactoeInvite {
        from: String,
        to: String,
        game_id: String,
        message_id: String,
        symbol: char,
        timestamp: u64,
        token: String,
    },
    TictactoeMove {
        from: String,
        to: String,
        game_id: String,
        message_id: String,
        position: u8,
        symbol: char,
        turn: u32,
        token: String,
    },
    TictactoeResult {
        from: String,
        to: String,
        game_id: String,
        message_id: String,
        result: String,
        symbol: char,
        winning_line: String,
        timestamp: u64,
        token: String,
    },
    TictactoeStateRequest {
        from: String,
        to: String,
        game_id: String,
    },
    TictactoeStateResponse {
        from: String,
        to: String,
        game_id: String,
        board: String,
        turn: u32,
        symbol: char,
    },
    TictactoeMoveRequest {
        from: String,
        to: String,
        game_id: String,
        from_turn: u32,
        to_turn: u32,
    },
    GroupCreate {
        from: String,
        group_id: String,
        group_name: String,
        members: Vec<String>,
        timestamp: u64,
        message_id: String,
        token: String,
    },
    GroupUpdate {
        from: String,
        group_id: String,
        add: Vec<String>,
        remove: Vec<String>,
        timestamp: u64,
        message_id: String,
        token: String,
    },
    GroupMessage {
        from: String,
        group_id: String,
        content: String,
        timestamp: u64,
        message_id: String,
        token: String,
    },
}

fn req<'a>(frame: &'a Frame, key: &'static str) -> Result<&'a str, FrameError> {
    frame.get(key).ok_or(FrameError::MissingField(key))
}

fn req_u64(frame: &Frame, key: &'static str) -> Result<u64, FrameError> {
    req(frame, key)?.parse().map_err(|_| FrameError::BadField(key))
}

fn req_u32(frame: &Frame, key: &'static str) -> Result<u32, FrameError> {
    req(frame, key)?.parse().map_err(|_| FrameError::BadField(key))
}

fn req_symbol(frame: &Frame, key: &'static str) -> Result<char, FrameError> {
    match req(frame, key)? {
        "X" => Ok('X'),
        "O" => Ok('O'),
        _ => Err(FrameError::BadField(key)),
    }
}

fn opt_list(frame: &Frame, key: &str) -> Vec<String> {
    frame
        .get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Message {
    /// The wire TYPE string for this variant.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Profile(_) => "PROFILE",
            Message::Ping { .. } => "PING",
            Message::Post { .. } => "POST",
            Message::Dm { .. } => "DM",
            Message::Ack { .. } => "ACK",
            Message::Follow { .. } => "FOLLOW",
            Message::Unfollow { .. } => "UNFOLLOW",
            Message::Like { .. } => "LIKE",
            Message::Revoke { .. } => "REVOKE",
            Message::FileOffer(_) => "FILE_OFFER",
            Message::FileChunk(_) => "FILE_CHUNK",
            Message::FileReceived { .. } => "FILE_RECEIVED",
            Message::TictactoeInvite { .. } => "TICTACTOE_INVITE",
            Message::TictactoeMove { .. } => "TICTACTOE_MOVE",
            Message::TictactoeResult { .. } => "TICTACTOE_RESULT",
            Message::TictactoeStateRequest { .. } => "TICTACTOE_STATE_REQUEST",
            Message::TictactoeStateResponse { .. } => "TICTACTOE_STATE_RESPONSE",
            Message::TictactoeMoveRequest { .. } => "TICTACTOE_MOVE_REQUEST",
            Message::GroupCreate { .. } => "GROUP_CREATE",
            Message::GroupUpdate { .. } => "GROUP_UPDATE",
            Message::GroupMessage { .. } => "GROUP_MESSAGE",
        }
    }

    /// The scope a valid token must carry for this TYPE. `None` means the
    /// TYPE is accepted without a token (and REVOKE, which is processed
    /// before any token check).
    pub fn required_scope(&self) -> Option<Scope> {
        match self {
            Message::Post { .. } | Message::Like { .. } => Some(Scope::Broadcast),
            Message::Dm { .. } => Some(Scope::Chat),
            Message::Follow { .. } | Message::Unfollow { .. } => Some(Scope::Follow),
            Message::FileOffer(_) | Message::FileChunk(_) => Some(Scope::File),
            Message::TictactoeInvite { .. }
            | Message::TictactoeMove { .. }
            | Message::TictactoeResult { .. } => Some(Scope::Game),
            Message::GroupCreate { .. }
            | Message::GroupUpdate { .. }
            | Message::GroupMessage { .. } => Some(Scope::Group),
            _ => None,
        }
    }

    /// The raw user_id string naming the sender, as carried on the wire
    /// (USER_ID for broadcast presence types, FROM elsewhere). ACK frames
    /// carry neither and return `None`.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Message::Profile(p) => Some(&p.user_id),
            Message::Ping { user_id } | Message::Post { user_id, .. } => Some(user_id),
            Message::Ack { .. } => None,
            Message::Dm { from, .. }
            | Message::Follow { from, .. }
            | Message::Unfollow { from, .. }
            | Message::Like { from, .. }
            | Message::Revoke { from, .. }
            | Message::FileReceived { from, .. }
            | Message::TictactoeInvite { from, .. }
            | Message::TictactoeMove { from, .. }
            | Message::TictactoeResult { from, .. }
            | Message::TictactoeStateRequest { from, .. }
            | Message::TictactoeStateResponse { from, .. }
            | Message::TictactoeMoveRequest { from, .. }
            | Message::GroupCreate { from, .. }
            | Message::GroupUpdate { from, .. }
            | Message::GroupMessage { from, .. } => Some(from),
            Message::FileOffer(p) => Some(&p.from),
            Message::FileChunk(p) => Some(&p.from),
        }
    }

    /// The token carried by this frame, if its TYPE uses one.
    pub fn token(&self) -> Option<&str> {
        match self {
            Message::Post { token, .. }
            | Message::Dm { token, .. }
            | Message::Follow { token, .. }
            | Message::Unfollow { token, .. }
            | Message::Like { token, .. }
            | Message::Revoke { token, .. }
            | Message::TictactoeInvite { token, .. }
            | Message::TictactoeMove { token, .. }
            | Message::TictactoeResult { token, .. }
            | Message::GroupCreate { token, .. }
            | Message::GroupUpdate { token, .. }
            | Message::GroupMessage { token, .. } => Some(token),
            Message::FileOffer(p) => Some(&p.token),
            Message::FileChunk(p) => Some(&p.token),
            _ => None,
        }
    }

    /// MESSAGE_ID if this TYPE carries one (the ACK-on-accept set).
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Message::Dm { message_id, .. }
            | Message::TictactoeInvite { message_id, .. }
            | Message::TictactoeMove { message_id, .. }
            | Message::TictactoeResult { message_id, .. }
            | Message::GroupCreate { message_id, .. }
            | Message::GroupUpdate { message_id, .. }
            | Message::GroupMessage { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Narrow a decoded frame into its typed variant.
    pub fn from_frame(frame: &Frame) -> Result<Message, FrameError> {
        let msg_type = frame.msg_type().ok_or(FrameError::MissingType)?;
        match msg_type {
            "PROFILE" => {
                let avatar = match frame.get("AVATAR_DATA") {
                    Some(data) => {
                        let mime = frame
                            .get("AVATAR_TYPE")
                            .unwrap_or("application/octet-stream")
                            .to_string();
                        let data = BASE64
                            .decode(data)
                            .map_err(|_| FrameError::BadField("AVATAR_DATA"))?;
                        Some(Avatar { mime, data })
                    }
                    None => None,
                };
                Ok(Message::Profile(ProfilePayload {
                    user_id: req(frame, "USER_ID")?.to_string(),
                    display_name: frame
                        .get("DISPLAY_NAME")
                        .unwrap_or_default()
                        .to_string(),
                    status: frame.get("STATUS").unwrap_or_default().to_string(),
                    port: match frame.get("PORT") {
                        Some(p) => {
                            Some(p.parse().map_err(|_| FrameError::BadField("PORT"))?)
                        }
                        None => None,
                    },
                    avatar,
                }))
            }
            "PING" => Ok(Message::Ping { user_id: req(frame, "USER_ID")?.to_string() }),
            "POST" => Ok(Message::Post {
                user_id: req(frame, "USER_ID")?.to_string(),
                content: req(frame, "CONTENT")?.to_string(),
                ttl: frame
                    .get("TTL")
                    .map(|v| v.parse().map_err(|_| FrameError::BadField("TTL")))
                    .transpose()?
                    .unwrap_or(3600),
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                timestamp: req_u64(frame, "TIMESTAMP")?,
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "DM" => Ok(Message::Dm {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                content: req(frame, "CONTENT")?.to_string(),
                timestamp: req_u64(frame, "TIMESTAMP")?,
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "ACK" => Ok(Message::Ack {
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                status: frame.get("STATUS").unwrap_or("RECEIVED").to_string(),
            }),
            "FOLLOW" | "UNFOLLOW" => {
                let from = req(frame, "FROM")?.to_string();
                let to = req(frame, "TO")?.to_string();
                let message_id = req(frame, "MESSAGE_ID")?.to_string();
                let timestamp = req_u64(frame, "TIMESTAMP")?;
                let token = req(frame, "TOKEN")?.to_string();
                if msg_type == "FOLLOW" {
                    Ok(Message::Follow { from, to, message_id, timestamp, token })
                } else {
                    Ok(Message::Unfollow { from, to, message_id, timestamp, token })
                }
            }
            "LIKE" => Ok(Message::Like {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                post_timestamp: req_u64(frame, "POST_TIMESTAMP")?,
                action: match frame.get("ACTION").unwrap_or("LIKE") {
                    "LIKE" => LikeAction::Like,
                    "UNLIKE" => LikeAction::Unlike,
                    _ => return Err(FrameError::BadField("ACTION")),
                },
                timestamp: req_u64(frame, "TIMESTAMP")?,
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "REVOKE" => Ok(Message::Revoke {
                from: req(frame, "FROM")?.to_string(),
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "FILE_OFFER" => Ok(Message::FileOffer(FileOfferPayload {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                filename: req(frame, "FILENAME")?.to_string(),
                filesize: req_u64(frame, "FILESIZE")?,
                filetype: req(frame, "FILETYPE")?.to_string(),
                file_id: req(frame, "FILEID")?.to_string(),
                description: frame.get("DESCRIPTION").unwrap_or_default().to_string(),
                timestamp: req_u64(frame, "TIMESTAMP")?,
                token: req(frame, "TOKEN")?.to_string(),
            })),
            "FILE_CHUNK" => Ok(Message::FileChunk(FileChunkPayload {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                file_id: req(frame, "FILEID")?.to_string(),
                chunk_index: req_u32(frame, "CHUNK_INDEX")?,
                total_chunks: req_u32(frame, "TOTAL_CHUNKS")?,
                chunk_size: req_u32(frame, "CHUNK_SIZE")?,
                token: req(frame, "TOKEN")?.to_string(),
                data: BASE64
                    .decode(req(frame, "DATA")?)
                    .map_err(|_| FrameError::BadField("DATA"))?,
            })),
            "FILE_RECEIVED" => Ok(Message::FileReceived {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                file_id: req(frame, "FILEID")?.to_string(),
                status: req(frame, "STATUS")?.to_string(),
                timestamp: req_u64(frame, "TIMESTAMP")?,
            }),
            "TICTACTOE_INVITE" => Ok(Message::TictactoeInvite {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                game_id: req(frame, "GAMEID")?.to_string(),
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                symbol: req_symbol(frame, "SYMBOL")?,
                timestamp: req_u64(frame, "TIMESTAMP")?,
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "TICTACTOE_MOVE" => {
                let position = req_u32(frame, "POSITION")?;
                if position > 8 {
                    return Err(FrameError::BadField("POSITION"));
                }
                Ok(Message::TictactoeMove {
                    from: req(frame, "FROM")?.to_string(),
                    to: req(frame, "TO")?.to_string(),
                    game_id: req(frame, "GAMEID")?.to_string(),
                    message_id: req(frame, "MESSAGE_ID")?.to_string(),
                    position: position as u8,
                    symbol: req_symbol(frame, "SYMBOL")?,
                    turn: req_u32(frame, "TURN")?,
                    token: req(frame, "TOKEN")?.to_string(),
                })
            }
            "TICTACTOE_RESULT" => Ok(Message::TictactoeResult {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                game_id: req(frame, "GAMEID")?.to_string(),
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                result: req(frame, "RESULT")?.to_string(),
                symbol: req_symbol(frame, "SYMBOL")?,
                winning_line: frame.get("WINNING_LINE").unwrap_or_default().to_string(),
                timestamp: req_u64(frame, "TIMESTAMP")?,
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "TICTACTOE_STATE_REQUEST" => Ok(Message::TictactoeStateRequest {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                game_id: req(frame, "GAMEID")?.to_string(),
            }),
            "TICTACTOE_STATE_RESPONSE" => Ok(Message::TictactoeStateResponse {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                game_id: req(frame, "GAMEID")?.to_string(),
                board: req(frame, "BOARD")?.to_string(),
                turn: req_u32(frame, "TURN")?,
                symbol: req_symbol(frame, "SYMBOL")?,
            }),
            "TICTACTOE_MOVE_REQUEST" => Ok(Message::TictactoeMoveRequest {
                from: req(frame, "FROM")?.to_string(),
                to: req(frame, "TO")?.to_string(),
                game_id: req(frame, "GAMEID")?.to_string(),
                from_turn: req_u32(frame, "FROM_TURN")?,
                to_turn: req_u32(frame, "TO_TURN")?,
            }),
            "GROUP_CREATE" => Ok(Message::GroupCreate {
                from: req(frame, "FROM")?.to_string(),
                group_id: req(frame, "GROUP_ID")?.to_string(),
                group_name: req(frame, "GROUP_NAME")?.to_string(),
                members: opt_list(frame, "MEMBERS"),
                timestamp: req_u64(frame, "TIMESTAMP")?,
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "GROUP_UPDATE" => Ok(Message::GroupUpdate {
                from: req(frame, "FROM")?.to_string(),
                group_id: req(frame, "GROUP_ID")?.to_string(),
                add: opt_list(frame, "ADD"),
                remove: opt_list(frame, "REMOVE"),
                timestamp: req_u64(frame, "TIMESTAMP")?,
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                token: req(frame, "TOKEN")?.to_string(),
            }),
            "GROUP_MESSAGE" => Ok(Message::GroupMessage {
                from: req(frame, "FROM")?.to_string(),
                group_id: req(frame, "GROUP_ID")?.to_string(),
                content: req(frame, "CONTENT")?.to_string(),
                timestamp: req_u64(frame, "TIMESTAMP")?,
                message_id: req(frame, "MESSAGE_ID")?.to_string(),
                token: req(frame, "TOKEN")?.to_string(),
            }),
            other => Err(FrameError::UnparsableLine(format!("unknown TYPE {other}"))),
        }
    }

    /// Build the wire frame for this message. TYPE goes first, then fields
    /// in the order the protocol documents them.
    pub fn to_frame(&self) -> Frame {
        let mut f = Frame::new(self.command());
        match self {
            Message::Profile(p) => {
                f.push("USER_ID", p.user_id.clone())
                    .push("DISPLAY_NAME", p.display_name.clone())
                    .push("STATUS", p.status.clone());
                if let Some(port) = p.port {
                    f.push("PORT", port.to_string());
                }
                if let Some(avatar) = &p.avatar {
                    f.push("AVATAR_TYPE", avatar.mime.clone())
                        .push("AVATAR_ENCODING", "base64")
                        .push("AVATAR_DATA", BASE64.encode(&avatar.data));
                }
            }
            Message::Ping { user_id } => {
                f.push("USER_ID", user_id.clone());
            }
            Message::Post { user_id, content, ttl, message_id, timestamp, token } => {
                f.push("USER_ID", user_id.clone())
                    .push("CONTENT", content.clone())
                    .push("TTL", ttl.to_string())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("TOKEN", token.clone());
            }
            Message::Dm { from, to, content, timestamp, message_id, token } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("CONTENT", content.clone())
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("TOKEN", token.clone());
            }
            Message::Ack { message_id, status } => {
                f.push("MESSAGE_ID", message_id.clone()).push("STATUS", status.clone());
            }
            Message::Follow { from, to, message_id, timestamp, token }
            | Message::Unfollow { from, to, message_id, timestamp, token } => {
                f.push("MESSAGE_ID", message_id.clone())
                    .push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("TOKEN", token.clone());
            }
            Message::Like { from, to, post_timestamp, action, timestamp, token } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("POST_TIMESTAMP", post_timestamp.to_string())
                    .push("ACTION", action.as_str())
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("TOKEN", token.clone());
            }
            Message::Revoke { from, token } => {
                f.push("FROM", from.clone()).push("TOKEN", token.clone());
            }
            Message::FileOffer(p) => {
                f.push("FROM", p.from.clone())
                    .push("TO", p.to.clone())
                    .push("FILENAME", p.filename.clone())
                    .push("FILESIZE", p.filesize.to_string())
                    .push("FILETYPE", p.filetype.clone())
                    .push("FILEID", p.file_id.clone())
                    .push("DESCRIPTION", p.description.clone())
                    .push("TIMESTAMP", p.timestamp.to_string())
                    .push("TOKEN", p.token.clone());
            }
            Message::FileChunk(p) => {
                f.push("FROM", p.from.clone())
                    .push("TO", p.to.clone())
                    .push("FILEID", p.file_id.clone())
                    .push("CHUNK_INDEX", p.chunk_index.to_string())
                    .push("TOTAL_CHUNKS", p.total_chunks.to_string())
                    .push("CHUNK_SIZE", p.chunk_size.to_string())
                    .push("TOKEN", p.token.clone())
                    .push("DATA", BASE64.encode(&p.data));
            }
            Message::FileReceived { from, to, file_id, status, timestamp } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("FILEID", file_id.clone())
                    .push("STATUS", status.clone())
                    .push("TIMESTAMP", timestamp.to_string());
            }
            Message::TictactoeInvite { from, to, game_id, message_id, symbol, timestamp, token } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("GAMEID", game_id.clone())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("SYMBOL", symbol.to_string())
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("TOKEN", token.clone());
            }
            Message::TictactoeMove { from, to, game_id, message_id, position, symbol, turn, token } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("GAMEID", game_id.clone())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("POSITION", position.to_string())
                    .push("SYMBOL", symbol.to_string())
                    .push("TURN", turn.to_string())
                    .push("TOKEN", token.clone());
            }
            Message::TictactoeResult {
                from,
                to,
                game_id,
                message_id,
                result,
                symbol,
                winning_line,
                timestamp,
                token,
            } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("GAMEID", game_id.clone())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("RESULT", result.clone())
                    .push("SYMBOL", symbol.to_string())
                    .push("WINNING_LINE", winning_line.clone())
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("TOKEN", token.clone());
            }
            Message::TictactoeStateRequest { from, to, game_id } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("GAMEID", game_id.clone());
            }
            Message::TictactoeStateResponse { from, to, game_id, board, turn, symbol } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("GAMEID", game_id.clone())
                    .push("BOARD", board.clone())
                    .push("TURN", turn.to_string())
                    .push("SYMBOL", symbol.to_string());
            }
            Message::TictactoeMoveRequest { from, to, game_id, from_turn, to_turn } => {
                f.push("FROM", from.clone())
                    .push("TO", to.clone())
                    .push("GAMEID", game_id.clone())
                    .push("FROM_TURN", from_turn.to_string())
                    .push("TO_TURN", to_turn.to_string());
            }
            Message::GroupCreate { from, group_id, group_name, members, timestamp, message_id, token } => {
                f.push("FROM", from.clone())
                    .push("GROUP_ID", group_id.clone())
                    .push("GROUP_NAME", group_name.clone())
                    .push("MEMBERS", members.join(","))
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("TOKEN", token.clone());
            }
            Message::GroupUpdate { from, group_id, add, remove, timestamp, message_id, token } => {
                f.push("FROM", from.clone())
                    .push("GROUP_ID", group_id.clone())
                    .push("ADD", add.join(","))
                    .push("REMOVE", remove.join(","))
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("TOKEN", token.clone());
            }
            Message::GroupMessage { from, group_id, content, timestamp, message_id, token } => {
                f.push("FROM", from.clone())
                    .push("GROUP_ID", group_id.clone())
                    .push("CONTENT", content.clone())
                    .push("TIMESTAMP", timestamp.to_string())
                    .push("MESSAGE_ID", message_id.clone())
                    .push("TOKEN", token.clone());
            }
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        let bytes = msg.to_frame().to_bytes();
        let frame = Frame::parse(&bytes).unwrap();
        Message::from_frame(&frame).unwrap()
    }

    #[test]
    fn test_dm_round_trip() {
        let msg = Message::Dm {
            from: "alice@192.168.1.7:50999".into(),
            to: "bob@192.168.1.9:51000".into(),
            content: "hi bob".into(),
            timestamp: 1_700_000_000,
            message_id: "abcd1234".into(),
            token: "alice@192.168.1.7:50999|1700007200|chat".into(),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_chunk_data_base64_round_trip() {
        let msg = Message::FileChunk(FileChunkPayload {
            from: "a@10.0.0.1:50999".into(),
            to: "b@10.0.0.2:50999".into(),
            file_id: "f00d0000".into(),
            chunk_index: 2,
            total_chunks: 3,
            chunk_size: 1024,
            token: "a@10.0.0.1:50999|99|file".into(),
            data: vec![0, 1, 2, 254, 255],
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_scope_table() {
        let cases: Vec<(Message, Option<Scope>)> = vec![
            (
                Message::Ping { user_id: "a@10.0.0.1".into() },
                None,
            ),
            (
                Message::Ack { message_id: "x".into(), status: "RECEIVED".into() },
                None,
            ),
            (
                Message::FileReceived {
                    from: "a@10.0.0.1".into(),
                    to: "b@10.0.0.2".into(),
                    file_id: "f".into(),
                    status: "COMPLETE".into(),
                    timestamp: 0,
                },
                None,
            ),
            (
                Message::TictactoeStateRequest {
                    from: "a@10.0.0.1".into(),
                    to: "b@10.0.0.2".into(),
                    game_id: "g1".into(),
                },
                None,
            ),
        ];
        for (msg, want) in cases {
            assert_eq!(msg.required_scope(), want, "{}", msg.command());
        }
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        // DM without CONTENT
        let raw = b"TYPE: DM\nFROM: a@10.0.0.1:1\nTO: b@10.0.0.2:1\nTIMESTAMP: 1\nMESSAGE_ID: m\nTOKEN: t\n\n";
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(
            Message::from_frame(&frame),
            Err(FrameError::MissingField("CONTENT"))
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let frame = Frame::parse(b"TYPE: GOSSIP\nFROM: a@10.0.0.1\n\n").unwrap();
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn test_move_position_bounds() {
        let raw = b"TYPE: TICTACTOE_MOVE\nFROM: a@10.0.0.1:1\nTO: b@10.0.0.2:1\nGAMEID: g1\nMESSAGE_ID: m\nPOSITION: 9\nSYMBOL: X\nTURN: 1\nTOKEN: t\n\n";
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(
            Message::from_frame(&frame),
            Err(FrameError::BadField("POSITION"))
        );
    }

    #[test]
    fn test_group_member_list_parsing() {
        let raw = b"TYPE: GROUP_UPDATE\nFROM: a@10.0.0.1:1\nGROUP_ID: g\nADD: b@10.0.0.2:1, c@10.0.0.3:1\nREMOVE: \nTIMESTAMP: 1\nMESSAGE_ID: m\nTOKEN: t\n\n";
        let frame = Frame::parse(raw).unwrap();
        match Message::from_frame(&frame).unwrap() {
            Message::GroupUpdate { add, remove, .. } => {
                assert_eq!(add, vec!["b@10.0.0.2:1", "c@10.0.0.3:1"]);
                assert!(remove.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
