//! Peer registry: everyone this node has heard from on the subnet.
//!
//! Keyed by canonical user_id. Every inbound frame upserts its sender, so
//! the registry converges without any dedicated discovery handshake. The
//! stored port always comes from the user_id, never from the UDP source
//! port — replies must target the peer's listener, not whatever ephemeral
//! socket a frame happened to leave from.

use crate::types::{Avatar, UserId, now};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub status: String,
    pub avatar: Option<Avatar>,
    /// Unix seconds of the last frame from this peer.
    pub last_seen: u64,
    /// Unix seconds of the last PROFILE we unicast to this peer (PING
    /// replies). Preserved across upserts.
    pub last_profile_sent: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerRegistryStats {
    pub total: usize,
    pub seen_last_minute: usize,
}

/// Process-wide peer map. All access goes through &self methods holding the
/// internal lock; compound read-modify operations stay inside one method so
/// callers never observe a half-applied update.
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerEntry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self { peers: Mutex::new(HashMap::new()) }
    }

    /// Insert or refresh a peer from an inbound frame. Returns true when
    /// the user_id was not known before.
    pub fn upsert(&self, user_id: UserId) -> bool {
        let mut peers = self.peers.lock().unwrap();
        let key = user_id.to_string();
        match peers.get_mut(&key) {
            Some(entry) => {
                entry.last_seen = now();
                false
            }
            None => {
                debug!("new peer {key}");
                peers.insert(
                    key,
                    PeerEntry {
                        display_name: user_id.username().to_string(),
                        user_id,
                        status: String::new(),
                        avatar: None,
                        last_seen: now(),
                        last_profile_sent: 0,
                    },
                );
                true
            }
        }
    }

    /// Apply PROFILE fields on top of a plain upsert.
    pub fn apply_profile(
        &self,
        user_id: UserId,
        display_name: &str,
        status: &str,
        avatar: Option<Avatar>,
    ) -> bool {
        let new = self.upsert(user_id.clone());
        let mut peers = self.peers.lock().unwrap();
        if let Some(entry) = peers.get_mut(&user_id.to_string()) {
            if !display_name.is_empty() {
                entry.display_name = display_name.to_string();
            }
            entry.status = status.to_string();
            if avatar.is_some() {
                entry.avatar = avatar;
            }
        }
        new
    }

    pub fn get(&self, user_id: &str) -> Option<PeerEntry> {
        self.peers.lock().unwrap().get(user_id).cloned()
    }

    /// Resolve a bare username to its peer entry. Usernames are not unique
    /// protocol-wide; the most recently seen match wins.
    pub fn find_by_username(&self, username: &str) -> Option<PeerEntry> {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.user_id.username() == username)
            .max_by_key(|p| p.last_seen)
            .cloned()
    }

    /// Accept a full `user@ip:port` id, a partial `user@ip`, or a bare
    /// username. Partial forms match the most recently seen peer with the
    /// same username (and ip, when one is given).
    pub fn resolve(&self, target: &str) -> Option<PeerEntry> {
        if let Some(entry) = self.get(target) {
            return Some(entry);
        }
        let Some((username, addr)) = target.rsplit_once('@') else {
            return self.find_by_username(target);
        };
        let ip = addr.split(':').next().and_then(|ip| ip.parse::<std::net::Ipv4Addr>().ok())?;
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.user_id.username() == username && p.user_id.ip() == ip)
            .max_by_key(|p| p.last_seen)
            .cloned()
    }

    pub fn list(&self, exclude: Option<&UserId>) -> Vec<PeerEntry> {
        let mut peers: Vec<PeerEntry> = self
            .peers
            .lock()
            .unwrap()
            .values()
            .filter(|p| exclude.is_none_or(|e| &p.user_id != e))
            .cloned()
            .collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    /// Manual removal (admin action); liveness is advisory and never
    /// evicts on its own.
    pub fn remove(&self, user_id: &str) -> bool {
        self.peers.lock().unwrap().remove(user_id).is_some()
    }

    pub fn mark_profile_sent(&self, user_id: &str) {
        if let Some(entry) = self.peers.lock().unwrap().get_mut(user_id) {
            entry.last_profile_sent = now();
        }
    }

    pub fn stats(&self) -> PeerRegistryStats {
        let peers = self.peers.lock().unwrap();
        let cutoff = now().saturating_sub(60);
        PeerRegistryStats {
            total: peers.len(),
            seen_last_minute: peers.values().filter(|p| p.last_seen >= cutoff).count(),
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
