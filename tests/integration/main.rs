//! Canopy integration test harness.
//!
//! Every test runs real nodes on 127.0.0.1 with short timeouts. Where a
//! test needs a misbehaving peer or a rendezvous server, it drives a raw
//! UDP socket through [`RawPeer`].
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use canopy_core::tree::DEFAULT_MAX_DEPTH;
use canopy_core::wire::{Frame, DATAGRAM_SIZE};
use canopy_core::ContentTree;
use canopy_services::{ExchangePolicy, Node, Session};

mod failures;
mod files;
mod nat;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Fresh scratch directory for one test.
pub fn scratch(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("canopy-it-{}-{test}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Deterministic, non-repeating-per-chunk content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 1024) % 251) as u8).collect()
}

pub fn fast_policy() -> ExchangePolicy {
    ExchangePolicy {
        handshake_timeout: Duration::from_millis(300),
        handshake_retries: 2,
        datum_deadline: Duration::from_secs(3),
        datum_read_timeout: Duration::from_millis(300),
    }
}

/// A node plus the shutdown channel that keeps its tasks alive.
pub struct TestPeer {
    pub node: Node,
    pub shutdown: broadcast::Sender<()>,
}

impl TestPeer {
    pub fn addr(&self) -> SocketAddr {
        self.node.local_addr()
    }
}

pub async fn spawn_peer(name: &str, share: Option<&Path>) -> Result<TestPeer> {
    spawn_peer_with(name, share, fast_policy()).await
}

pub async fn spawn_peer_with(name: &str, share: Option<&Path>, policy: ExchangePolicy) -> Result<TestPeer> {
    let tree = share
        .map(|p| ContentTree::build(p, DEFAULT_MAX_DEPTH))
        .transpose()
        .context("failed to build share")?;
    let session = Session::new(name, tree.as_ref().map(|t| t.root_hash()));
    let (shutdown, _) = broadcast::channel(1);
    let node = Node::bind(
        "127.0.0.1:0".parse()?,
        session,
        tree.map(Arc::new),
        policy,
        &shutdown,
    )
    .await?;
    Ok(TestPeer { node, shutdown })
}

/// A bare socket speaking frames by hand.
pub struct RawPeer {
    pub socket: UdpSocket,
}

impl RawPeer {
    pub async fn bind() -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, frame: &Frame, to: SocketAddr) -> Result<()> {
        self.socket.send_to(&frame.encode()?, to).await?;
        Ok(())
    }

    /// Next decodable frame within `wait`, or None.
    pub async fn recv(&self, wait: Duration) -> Option<(Frame, SocketAddr)> {
        let mut buf = vec![0u8; DATAGRAM_SIZE];
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let (len, from) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .ok()?;
            if let Ok(frame) = Frame::decode(&buf[..len]) {
                return Some((frame, from));
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn pattern_is_deterministic() {
    assert_eq!(pattern(2500), pattern(2500));
    assert_ne!(pattern(2048)[..1024], pattern(2048)[1024..]);
}

#[tokio::test]
async fn raw_peer_times_out_quietly() {
    let raw = RawPeer::bind().await.unwrap();
    assert!(raw.recv(Duration::from_millis(50)).await.is_none());
}
