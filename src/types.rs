//! Shared primitive types: user identities, avatars, unix time.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Canonical LSNP user identity: `username@ip:port`.
///
/// Frames on the wire may carry the partial form `username@ip`; the registry
/// rewrites those to canonical form on ingest by filling in a fallback port.
/// The port stored here is the peer's *listening* port, which is not
/// necessarily the UDP source port of any given datagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId {
    username: String,
    ip: Ipv4Addr,
    port: u16,
}

impl UserId {
    pub fn new(username: impl Into<String>, ip: Ipv4Addr, port: u16) -> Self {
        Self { username: username.into(), ip, port }
    }

    /// Parse `username@ip[:port]`. A missing port is filled from
    /// `fallback_port`; a missing or unparseable ip fails outright.
    pub fn parse(raw: &str, fallback_port: u16) -> Option<UserId> {
        let raw = raw.trim();
        let (username, addr) = raw.rsplit_once('@')?;
        if username.is_empty() {
            return None;
        }
        let (ip, port) = match addr.split_once(':') {
            Some((ip, port)) => (ip, port.parse::<u16>().ok()?),
            None => (addr, fallback_port),
        };
        let ip = ip.parse::<Ipv4Addr>().ok()?;
        Some(UserId { username: username.to_string(), ip, port })
    }

    /// The ip embedded between `@` and `:`, without requiring a full parse.
    /// Used for token bind checks on raw token prefixes.
    pub fn embedded_ip(raw: &str) -> Option<Ipv4Addr> {
        let (_, addr) = raw.rsplit_once('@')?;
        let ip = addr.split_once(':').map(|(ip, _)| ip).unwrap_or(addr);
        ip.parse::<Ipv4Addr>().ok()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The unicast destination for this user.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.ip, self.port)
    }
}

/// An inline profile picture: mime type plus raw (decoded) image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub mime: String,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let uid = UserId::parse("alice@192.168.1.7:51002", 50999).unwrap();
        assert_eq!(uid.username(), "alice");
        assert_eq!(uid.ip(), Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(uid.port(), 51002);
        assert_eq!(uid.to_string(), "alice@192.168.1.7:51002");
    }

    #[test]
    fn test_parse_partial_takes_fallback_port() {
        let uid = UserId::parse("bob@10.0.0.3", 50999).unwrap();
        assert_eq!(uid.port(), 50999);
        assert_eq!(uid.to_string(), "bob@10.0.0.3:50999");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(UserId::parse("nobody", 50999).is_none());
        assert!(UserId::parse("@10.0.0.3:1", 50999).is_none());
        assert!(UserId::parse("x@nothost:1", 50999).is_none());
        assert!(UserId::parse("x@10.0.0.3:notport", 50999).is_none());
    }

    #[test]
    fn test_embedded_ip() {
        assert_eq!(
            UserId::embedded_ip("alice@192.168.1.7:51002"),
            Some(Ipv4Addr::new(192, 168, 1, 7))
        );
        assert_eq!(
            UserId::embedded_ip("alice@192.168.1.7"),
            Some(Ipv4Addr::new(192, 168, 1, 7))
        );
        assert_eq!(UserId::embedded_ip("alice"), None);
    }
}
