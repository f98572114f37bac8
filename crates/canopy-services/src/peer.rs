//! Peer table — who has said Hello to us, and when.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Tracked state for a peer that greeted us.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Name from the peer's Hello.
    pub name: String,

    /// UDP source address of the Hello. Behind NAT this is the translated
    /// address, which is the one replies must go to.
    pub addr: SocketAddr,

    pub first_seen: Instant,

    /// Last time a Hello arrived from this address.
    pub last_seen: Instant,
}

impl PeerEntry {
    pub fn new(name: String, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            name,
            addr,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// The peer table, shared by the responder and NAT traversal.
/// Keyed on source address.
pub type PeerTable = Arc<DashMap<SocketAddr, PeerEntry>>;

/// Create a new empty peer table.
pub fn new_peer_table() -> PeerTable {
    Arc::new(DashMap::new())
}

/// Insert or refresh the entry for `addr`.
pub fn record_hello(table: &PeerTable, addr: SocketAddr, name: &str) {
    table
        .entry(addr)
        .and_modify(|e| {
            e.last_seen = Instant::now();
            if e.name != name {
                e.name = name.to_string();
            }
        })
        .or_insert_with(|| PeerEntry::new(name.to_string(), addr));
}

/// Most recently seen address for a peer name.
pub fn find_by_name(table: &PeerTable, name: &str) -> Option<SocketAddr> {
    table
        .iter()
        .filter(|e| e.name == name)
        .max_by_key(|e| e.last_seen)
        .map(|e| e.addr)
}

/// Drop peers not seen within `ttl`. Returns how many were removed.
pub fn expire(table: &PeerTable, ttl: Duration) -> usize {
    let before = table.len();
    table.retain(|_, e| e.last_seen.elapsed() < ttl);
    before - table.len()
}
