//! Reliable unicast: MESSAGE_ID correlation and bounded retransmission.
//!
//! Delivery-guaranteed frames (DM, game moves and results, group traffic)
//! carry a fresh random MESSAGE_ID. The originator registers the id in the
//! shared [`AckTable`], transmits, and waits; ACKs arrive through the main
//! listener like any other frame and resolve the waiter by id. Each frame
//! gets three transmissions, each with a two-second ACK window and a
//! one-second gap before the next try.

use super::transport::{Target, Transport};
use super::types::{ACK_TIMEOUT_SECS, RETRY_GAP_SECS, SEND_ATTEMPTS};
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Fresh 4-byte hex id for MESSAGE_ID, FILEID, and GAMEID fields.
pub fn new_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Pending-ACK waiters keyed by MESSAGE_ID. Shared between the dispatcher
/// (which resolves) and every originating task (which registers).
pub struct AckTable {
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl AckTable {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Register interest in an ACK. A second registration for the same id
    /// replaces the first (its waiter then reads "failed").
    pub fn register(&self, message_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(message_id.to_string(), tx);
        rx
    }

    /// Called by the dispatcher when an ACK frame arrives. Returns false
    /// for ids nobody is waiting on (late or duplicate ACKs).
    pub fn resolve(&self, message_id: &str) -> bool {
        match self.pending.lock().unwrap().remove(message_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, message_id: &str) {
        self.pending.lock().unwrap().remove(message_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Default for AckTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Transmit `payload` to `dest` until the matching ACK arrives or the
/// attempt budget runs out. Returns true on acknowledged delivery; callers
/// are responsible for reverting tentative state on false.
pub async fn send_with_retries(
    transport: &Transport,
    acks: &AckTable,
    dest: SocketAddr,
    message_id: &str,
    payload: Vec<u8>,
) -> bool {
    let mut rx = acks.register(message_id);

    for attempt in 1..=SEND_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(Duration::from_secs(RETRY_GAP_SECS)).await;
            debug!("retry {attempt}/{SEND_ATTEMPTS} for {message_id} to {dest}");
        }
        transport.send(Target::Unicast(dest), payload.clone()).await;

        match tokio::time::timeout(Duration::from_secs(ACK_TIMEOUT_SECS), &mut rx).await {
            Ok(Ok(())) => return true,
            // The table entry was replaced or dropped; treat as failed.
            Ok(Err(_)) => break,
            // No ACK inside the window; go around again.
            Err(_) => continue,
        }
    }

    acks.cancel(message_id);
    warn!("no ACK for {message_id} from {dest} after {SEND_ATTEMPTS} attempts");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_id(), id);
    }

    #[tokio::test]
    async fn test_resolve_wakes_registered_waiter() {
        let table = AckTable::new();
        let rx = table.register("abcd1234");
        assert!(table.resolve("abcd1234"));
        assert!(rx.await.is_ok());
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_ack_is_ignored() {
        let table = AckTable::new();
        assert!(!table.resolve("ffffffff"));
    }

    #[tokio::test]
    async fn test_cancel_drops_waiter() {
        let table = AckTable::new();
        let rx = table.register("abcd1234");
        table.cancel("abcd1234");
        assert!(rx.await.is_err());
        assert!(!table.resolve("abcd1234"));
    }
}
