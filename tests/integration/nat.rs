use std::collections::HashMap;
use std::time::Duration;

use canopy_core::wire::{self, Frame, MessageType, TraversalHint};
use canopy_services::{DirectoryError, NatPolicy, PeerDirectory, Traversal};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  NAT traversal through a scripted rendezvous server
// ══════════════════════════════════════════════════════════════════════════════

/// Directory answers fixed in advance.
#[derive(Default)]
struct StaticDirectory {
    entries: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    fn with(mut self, name: &str, addresses: &[&str]) -> Self {
        self.entries
            .insert(name.to_string(), addresses.iter().map(|a| a.to_string()).collect());
        self
    }
}

impl PeerDirectory for StaticDirectory {
    async fn addresses(&self, name: &str) -> Result<Vec<String>, DirectoryError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownPeer(name.to_string()))
    }
}

fn one_attempt() -> NatPolicy {
    NatPolicy { direct_attempts: 1 }
}

#[tokio::test]
async fn reachable_peer_is_contacted_directly() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let bob = spawn_peer("bob", None).await.unwrap();
    let server = RawPeer::bind().await.unwrap();

    let directory = StaticDirectory::default().with("bob", &[&bob.addr().to_string()]);
    let traversal = alice.node.traversal(directory, server.addr(), one_attempt());

    let outcome = traversal.traverse("bob", Some(bob.addr())).await;
    assert_eq!(outcome, Traversal::Direct(bob.addr()));
    assert!(server.recv(Duration::from_millis(200)).await.is_none());
}

/// Alice's direct Hellos go nowhere; the server relays her address to
/// Bob, whose Hello opens the path.
#[tokio::test]
async fn silent_peer_is_reached_through_the_server() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let bob = spawn_peer("bob", None).await.unwrap();
    let server = RawPeer::bind().await.unwrap();
    let dead = RawPeer::bind().await.unwrap();

    let directory = StaticDirectory::default().with("bob", &[&bob.addr().to_string()]);
    let traversal = alice.node.traversal(directory, server.addr(), one_attempt());

    let relay = async {
        loop {
            let (frame, from) = server.recv(Duration::from_secs(3)).await.expect("no traversal request");
            if frame.msg_type != MessageType::NatTraversalRequest {
                continue;
            }
            let target = wire::decode_addr(&frame.body).unwrap();
            let hint = TraversalHint { addr: from, hash: None };
            server
                .send(&Frame::new(77, MessageType::NatTraversal, hint.encode()), target)
                .await
                .unwrap();
            return (target, from);
        }
    };

    let (outcome, (target, requester)) = tokio::join!(traversal.traverse("bob", Some(dead.addr())), relay);
    assert_eq!(target, bob.addr());
    assert_eq!(requester, alice.addr());
    assert_eq!(outcome, Traversal::Relayed(bob.addr()));

    // The direct attempt did reach the dead address.
    let (hello, _) = dead.recv(Duration::from_millis(200)).await.unwrap();
    assert_eq!(hello.msg_type, MessageType::Hello);
}

#[tokio::test]
async fn unusable_address_fails_without_asking_the_server() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let server = RawPeer::bind().await.unwrap();

    let directory = StaticDirectory::default().with("bob", &["not an address", "[::1"]);
    let traversal = alice.node.traversal(directory, server.addr(), one_attempt());

    assert_eq!(traversal.traverse("bob", None).await, Traversal::Failed);
    assert!(server.recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn unknown_peer_fails() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let server = RawPeer::bind().await.unwrap();

    let traversal = alice
        .node
        .traversal(StaticDirectory::default(), server.addr(), one_attempt());
    assert_eq!(traversal.traverse("nobody", None).await, Traversal::Failed);
}

/// Nobody answers the relay: every attempt asks the server once.
#[tokio::test]
async fn unanswered_relay_gives_up_after_the_attempt_budget() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let server = RawPeer::bind().await.unwrap();
    let dead = RawPeer::bind().await.unwrap();

    let directory = StaticDirectory::default().with("bob", &[&dead.addr().to_string()]);
    let traversal = alice
        .node
        .traversal(directory, server.addr(), NatPolicy { direct_attempts: 2 });

    assert_eq!(traversal.traverse("bob", None).await, Traversal::Failed);

    let mut requests = 0;
    while let Some((frame, _)) = server.recv(Duration::from_millis(100)).await {
        assert_eq!(frame.msg_type, MessageType::NatTraversalRequest);
        assert_eq!(wire::decode_addr(&frame.body).unwrap(), dead.addr());
        requests += 1;
    }
    assert_eq!(requests, 2);
}
