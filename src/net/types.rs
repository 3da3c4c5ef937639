// LSNP Core — Constants and Types
// Distributed under the MIT software license.

//! Network constants and shared types for the LSNP wire protocol.
//!
//! Every timeout, retry bound, and size cap of the protocol lives here.
//! Handlers and the transport must use these constants instead of local
//! literals so the limits stay consistent across the crate.

use std::path::PathBuf;

// =============================================================================
// PORTS
// =============================================================================

/// Default UDP port. Broadcast traffic always targets this port.
pub const DEFAULT_PORT: u16 = 50999;

/// How many ports above [`DEFAULT_PORT`] the listener probes before
/// giving up (50999..=51098).
pub const PORT_PROBE_RANGE: u16 = 100;

// =============================================================================
// FRAME SIZE LIMITS
// =============================================================================

/// Maximum outbound size for general frames (4 KiB).
pub const MAX_FRAME_SIZE: usize = 4096;

/// A PROFILE carrying a base64 avatar may exceed [`MAX_FRAME_SIZE`];
/// it is capped here instead.
pub const MAX_PROFILE_FRAME_SIZE: usize = 32 * 1024;

/// Listener receive buffer. Larger than any legal frame so oversized
/// datagrams are observed (and dropped) rather than truncated.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Raw bytes per file chunk. Base64 expansion keeps the encoded DATA
/// field at or under 1368 bytes.
pub const CHUNK_RAW_SIZE: usize = 1024;

/// Raw avatar cap before base64 expansion.
pub const MAX_AVATAR_BYTES: usize = 20 * 1024;

// =============================================================================
// RELIABLE UNICAST
// =============================================================================

/// How long each transmission waits for an ACK.
pub const ACK_TIMEOUT_SECS: u64 = 2;

/// Total transmissions of one reliable frame before it is declared failed.
pub const SEND_ATTEMPTS: u32 = 3;

/// Sleep between retransmissions.
pub const RETRY_GAP_SECS: u64 = 1;

// =============================================================================
// PRESENCE AND TIMEOUTS
// =============================================================================

/// Length of the initial discovery burst after startup.
pub const BURST_WINDOW_SECS: u64 = 5;

/// Steady-state PING cadence.
pub const PING_INTERVAL_SECS: u64 = 300;

/// A game idle longer than this is garbage-collected.
pub const GAME_IDLE_TIMEOUT_SECS: u64 = 60;

/// How often the sweeper looks for idle games.
pub const GAME_SWEEP_INTERVAL_SECS: u64 = 10;

// =============================================================================
// TOKEN SCOPES
// =============================================================================

/// The feature a capability token authorises. Serialised as a lowercase
/// word in the third token field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Broadcast,
    Chat,
    File,
    Game,
    Group,
    Follow,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Broadcast => "broadcast",
            Scope::Chat => "chat",
            Scope::File => "file",
            Scope::Game => "game",
            Scope::Group => "group",
            Scope::Follow => "follow",
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        match s {
            "broadcast" => Some(Scope::Broadcast),
            "chat" => Some(Scope::Chat),
            "file" => Some(Scope::File),
            "game" => Some(Scope::Game),
            "group" => Some(Scope::Group),
            "follow" => Some(Scope::Follow),
            _ => None,
        }
    }

    /// Default lifetime of a freshly issued token for this scope.
    pub fn default_ttl(&self) -> u64 {
        match self {
            Scope::Broadcast => 3600,
            Scope::Chat => 7200,
            Scope::File => 14400,
            Scope::Game => 10800,
            Scope::Group => 86400,
            Scope::Follow => 3600,
        }
    }
}

// =============================================================================
// NODE CONFIGURATION
// =============================================================================

/// Engine configuration, filled by the binary from CLI flags.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Local username (the part before `@` in the user_id).
    pub username: String,
    /// Human-readable name advertised in PROFILE frames.
    pub display_name: String,
    /// Free-text status advertised in PROFILE frames.
    pub status: String,
    /// First port the listener tries; probing walks upward from here.
    pub port: u16,
    /// Directory holding `revoked_tokens.json`.
    pub data_dir: PathBuf,
    /// Where completed inbound file transfers are written.
    pub download_dir: PathBuf,
    /// Surface per-drop diagnostics as events.
    pub verbose: bool,
}

impl NetConfig {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            display_name: username.clone(),
            username,
            status: "Active".to_string(),
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("./lsnp-data"),
            download_dir: PathBuf::from("./lsnp-data/downloads"),
            verbose: false,
        }
    }
}
