//! LSNP networking layer

pub mod file_transfer;
pub mod frame;
pub mod groups;
pub mod message;
pub mod peers;
pub mod presence;
pub mod protocol;
pub mod reliable;
pub mod tictactoe;
pub mod token;
pub mod transport;
pub mod types;

// Re-exports
pub use file_transfer::{InboundTransfer, OutboundTransfer, TransferTable, guess_mime};
pub use frame::{Frame, FrameError};
pub use groups::{Group, GroupTable, UpdateOutcome};
pub use message::{FileChunkPayload, FileOfferPayload, LikeAction, Message, ProfilePayload};
pub use peers::{PeerEntry, PeerRegistry, PeerRegistryStats};
pub use presence::{LocalProfile, load_avatar};
pub use protocol::{NetError, NetEvent, NetStats, Network};
pub use reliable::{AckTable, new_id};
pub use tictactoe::{Game, GameResult, GameTable, MoveOutcome, Symbol, WINNING_LINES};
pub use token::{Token, TokenService};
pub use transport::{Target, Transport, detect_local_ip, subnet_broadcast};
pub use types::*;
