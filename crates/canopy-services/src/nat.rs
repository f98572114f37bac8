//! NAT traversal — reach a peer directly, or get the server to introduce us.
//!
//! Direct first: Hello to the peer's known address, up to `direct_attempts`
//! times. If that stays silent, ask the rendezvous server to relay a
//! NatTraversal to the peer's advertised address and wait for the peer's
//! Hello to arrive through the hole it punches. The Responder answers that
//! Hello; we follow up with our own Hello so the return path is open on our
//! side as well.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;

use canopy_core::config::NatConfig;
use canopy_core::wire::{self, Hello, MessageType};

use crate::directory::{self, PeerDirectory};
use crate::exchange::Exchange;
use crate::responder::HelloEvent;

/// How a traversal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// The peer answered a direct Hello.
    Direct(SocketAddr),
    /// The peer greeted us after the server relayed our request.
    Relayed(SocketAddr),
    Failed,
}

impl Traversal {
    pub fn succeeded(self) -> bool {
        !matches!(self, Traversal::Failed)
    }

    /// Address the peer is reachable at.
    pub fn addr(self) -> Option<SocketAddr> {
        match self {
            Traversal::Direct(a) | Traversal::Relayed(a) => Some(a),
            Traversal::Failed => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NatPolicy {
    pub direct_attempts: u32,
}

impl Default for NatPolicy {
    fn default() -> Self {
        Self::from(&NatConfig::default())
    }
}

impl From<&NatConfig> for NatPolicy {
    fn from(config: &NatConfig) -> Self {
        Self {
            direct_attempts: config.direct_attempts.max(1),
        }
    }
}

pub struct NatTraversal<D> {
    exchange: Arc<Exchange>,
    directory: D,
    server: SocketAddr,
    hellos: broadcast::Sender<HelloEvent>,
    policy: NatPolicy,
}

impl<D: PeerDirectory> NatTraversal<D> {
    pub fn new(
        exchange: Arc<Exchange>,
        directory: D,
        server: SocketAddr,
        hellos: broadcast::Sender<HelloEvent>,
        policy: NatPolicy,
    ) -> Self {
        Self {
            exchange,
            directory,
            server,
            hellos,
            policy,
        }
    }

    /// Open a path to `peer`. `known` is tried directly first, when given.
    pub async fn traverse(&self, peer: &str, known: Option<SocketAddr>) -> Traversal {
        let attempts = self.policy.direct_attempts;

        if let Some(addr) = known {
            let hello = Hello::new(self.exchange.session().peer_name()).encode();
            match self
                .exchange
                .request_with(addr, MessageType::Hello, hello, MessageType::HelloReply, attempts)
                .await
            {
                Ok(_) => {
                    tracing::info!(peer, %addr, "direct path open");
                    return Traversal::Direct(addr);
                }
                Err(e) => tracing::warn!(peer, %addr, error = %e, "direct contact failed"),
            }
        }

        // Subscribe before asking, so the peer's Hello cannot slip past.
        let mut hellos = self.hellos.subscribe();

        let advertised = match self.directory.addresses(peer).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(peer, error = %e, "directory lookup failed");
                return Traversal::Failed;
            }
        };
        let candidates = directory::parse_endpoints(&advertised);
        let Some(target) = candidates.first().copied() else {
            tracing::warn!(peer, ?advertised, "no usable address advertised");
            return Traversal::Failed;
        };
        let record = wire::encode_addr(target);

        let per_attempt = self.exchange.policy().handshake_timeout;
        for attempt in 1..=attempts {
            if let Err(e) = self
                .exchange
                .notify(self.server, MessageType::NatTraversalRequest, record.clone())
                .await
            {
                tracing::warn!(peer, server = %self.server, error = %e, "traversal request not sent");
                return Traversal::Failed;
            }
            tracing::debug!(peer, %target, server = %self.server, attempt, "traversal requested");

            let until = Instant::now() + per_attempt;
            loop {
                let event = match tokio::time::timeout_at(until, hellos.recv()).await {
                    Err(_) => break,
                    Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                        tracing::debug!(skipped = n, "hello feed lagged");
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return Traversal::Failed,
                    Ok(Ok(event)) => event,
                };
                let from_peer = event.name == peer
                    || candidates.iter().any(|c| c.ip() == event.from.ip());
                if !from_peer {
                    continue;
                }
                if let Err(e) = self
                    .exchange
                    .notify(
                        event.from,
                        MessageType::Hello,
                        Hello::new(self.exchange.session().peer_name()).encode(),
                    )
                    .await
                {
                    tracing::warn!(peer, addr = %event.from, error = %e, "return hello not sent");
                }
                tracing::info!(peer, addr = %event.from, "relayed path open");
                return Traversal::Relayed(event.from);
            }
        }

        tracing::warn!(peer, attempts, "traversal failed");
        Traversal::Failed
    }
}
