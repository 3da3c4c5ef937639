//! Capability tokens and the persistent revocation set.
//!
//! A token is three pipe-delimited fields: `user_id|expiry_unix|scope`.
//! Tokens are advisory capabilities, not MACs; the only binding to a sender
//! is the ip embedded in the user_id prefix, checked against the UDP source
//! ip. Revocation is permanent and survives restarts via
//! `revoked_tokens.json` (a JSON array of exact token strings).

use super::types::Scope;
use crate::types::{UserId, now};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Reject revocation files beyond this size before deserialisation.
const MAX_REVOKED_FILE_SIZE: u64 = 1024 * 1024;

/// A parsed token. The `user_id` keeps its raw wire form; canonicalisation
/// is irrelevant here because validity never depends on the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub user_id: String,
    pub expiry: u64,
    pub scope: Scope,
}

impl Token {
    /// Parse `user_id|expiry_unix|scope`. The user_id itself never contains
    /// `|`, so a plain three-way split is exact.
    pub fn parse(raw: &str) -> Option<Token> {
        let mut parts = raw.split('|');
        let user_id = parts.next()?.to_string();
        let expiry = parts.next()?.parse().ok()?;
        let scope = Scope::parse(parts.next()?)?;
        if parts.next().is_some() || user_id.is_empty() {
            return None;
        }
        Some(Token { user_id, expiry, scope })
    }
}

/// Issues, validates, and revokes tokens. One instance per node, shared by
/// every handler. The revoked set is the only state this service persists.
pub struct TokenService {
    revoked: Mutex<HashSet<String>>,
    path: PathBuf,
}

impl TokenService {
    /// Load the revoked set from `dir/revoked_tokens.json`. A missing file
    /// is an empty set; a corrupt one is replaced on the next revocation.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("revoked_tokens.json");
        let revoked = match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > MAX_REVOKED_FILE_SIZE => {
                warn!("revoked token file too large ({} bytes), ignoring", meta.len());
                HashSet::new()
            }
            Ok(_) => match std::fs::read(&path) {
                Ok(data) => match serde_json::from_slice::<Vec<String>>(&data) {
                    Ok(tokens) => {
                        info!("loaded {} revoked tokens", tokens.len());
                        tokens.into_iter().collect()
                    }
                    Err(e) => {
                        warn!("unreadable revoked token file: {e}");
                        HashSet::new()
                    }
                },
                Err(e) => {
                    warn!("failed to read revoked token file: {e}");
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        };
        Self { revoked: Mutex::new(revoked), path }
    }

    /// Mint a token for `user_id` with the scope's default TTL, or an
    /// explicit one.
    pub fn issue(&self, user_id: &UserId, scope: Scope, ttl: Option<u64>) -> String {
        let ttl = ttl.unwrap_or_else(|| scope.default_ttl());
        format!("{}|{}|{}", user_id, now() + ttl, scope.as_str())
    }

    /// A token is valid iff it parses, is not revoked, has not expired, and
    /// carries exactly the expected scope.
    pub fn validate(&self, raw: &str, expected: Scope) -> bool {
        let Some(token) = Token::parse(raw) else {
            return false;
        };
        if token.scope != expected {
            return false;
        }
        if token.expiry <= now() {
            return false;
        }
        !self.is_revoked(raw)
    }

    /// Compare the ip embedded in the token's user_id prefix against the
    /// UDP source ip of the frame that carried it.
    pub fn bind_check(raw: &str, source_ip: IpAddr) -> bool {
        let Some(prefix) = raw.split('|').next() else {
            return false;
        };
        match UserId::embedded_ip(prefix) {
            Some(embedded) => IpAddr::V4(embedded) == source_ip,
            None => false,
        }
    }

    pub fn is_revoked(&self, raw: &str) -> bool {
        self.revoked.lock().unwrap().contains(raw)
    }

    /// Add the exact token string to the revoked set and rewrite the file.
    /// Expiry never removes an entry. Returns false if it was already
    /// revoked (no rewrite).
    pub fn revoke(&self, raw: &str) -> std::io::Result<bool> {
        let snapshot: Vec<String> = {
            let mut revoked = self.revoked.lock().unwrap();
            if !revoked.insert(raw.to_string()) {
                return Ok(false);
            }
            let mut tokens: Vec<String> = revoked.iter().cloned().collect();
            tokens.sort();
            tokens
        };
        debug!("revoking token, {} total", snapshot.len());
        self.save(&snapshot)?;
        Ok(true)
    }

    /// Atomic replace: write a sibling temp file, then rename over the
    /// target. Readers never observe a half-written set.
    fn save(&self, tokens: &[String]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(tokens)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.lock().unwrap().len()
    }
}
