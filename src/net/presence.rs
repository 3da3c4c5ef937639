//! Presence: PROFILE/PING frame construction and avatar handling.
//!
//! The periodic loops themselves live on the engine (they need the
//! transport); this module owns what goes inside the frames.

use super::file_transfer::guess_mime;
use super::message::{Message, ProfilePayload};
use super::protocol::NetError;
use super::types::MAX_AVATAR_BYTES;
use crate::types::{Avatar, UserId};
use std::path::Path;

/// The locally advertised identity, mutable at runtime via `set_avatar`
/// and friends.
#[derive(Debug, Clone)]
pub struct LocalProfile {
    pub display_name: String,
    pub status: String,
    pub avatar: Option<Avatar>,
}

/// Read an image from disk and size-check it for PROFILE embedding.
pub fn load_avatar(path: &Path) -> Result<Avatar, NetError> {
    let data = std::fs::read(path)?;
    if data.len() > MAX_AVATAR_BYTES {
        return Err(NetError::Command(format!(
            "avatar too large ({} bytes, limit {MAX_AVATAR_BYTES})",
            data.len()
        )));
    }
    Ok(Avatar { mime: guess_mime(path).to_string(), data })
}

/// The PROFILE frame advertised on broadcast and in PING replies. PORT is
/// carried explicitly so receivers can canonicalise a partial user_id.
pub fn profile_message(user_id: &UserId, profile: &LocalProfile) -> Message {
    Message::Profile(ProfilePayload {
        user_id: user_id.to_string(),
        display_name: profile.display_name.clone(),
        status: profile.status.clone(),
        port: Some(user_id.port()),
        avatar: profile.avatar.clone(),
    })
}

pub fn ping_message(user_id: &UserId) -> Message {
    Message::Ping { user_id: user_id.to_string() }
}
