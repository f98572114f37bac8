//! Node — one socket, its pump, its responder and its exchange.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use canopy_core::ContentTree;

use crate::directory::PeerDirectory;
use crate::download::RemotePeer;
use crate::exchange::{Exchange, ExchangePolicy};
use crate::link::Link;
use crate::nat::{NatPolicy, NatTraversal};
use crate::peer::{self, PeerTable};
use crate::registration::{Registrar, RegistrationPolicy};
use crate::responder::{HelloEvent, Responder};
use crate::session::Session;

pub struct Node {
    local_addr: SocketAddr,
    session: Arc<Session>,
    exchange: Arc<Exchange>,
    peers: PeerTable,
    hellos: broadcast::Sender<HelloEvent>,
    link_task: JoinHandle<Result<()>>,
    responder_task: JoinHandle<Result<()>>,
}

impl Node {
    /// Bind `addr` and start serving on it.
    pub async fn bind(
        addr: SocketAddr,
        session: Session,
        tree: Option<Arc<ContentTree>>,
        policy: ExchangePolicy,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        Self::start(socket, session, tree, policy, shutdown)
    }

    /// Spawn the link and responder tasks for `socket`.
    pub fn start(
        socket: UdpSocket,
        session: Session,
        tree: Option<Arc<ContentTree>>,
        policy: ExchangePolicy,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Self> {
        let local_addr = socket.local_addr().context("socket has no local address")?;
        let socket = Arc::new(socket);
        let session = Arc::new(session);
        let peers = peer::new_peer_table();

        let (link, channels) = Link::new(socket.clone(), shutdown.subscribe());
        let responder = Responder::new(socket.clone(), session.clone(), tree, peers.clone());
        let hellos = responder.hello_events();
        let exchange = Arc::new(Exchange::new(socket, session.clone(), channels.replies, policy));

        let link_task = tokio::spawn(link.run());
        let responder_task = tokio::spawn(responder.run(channels.requests, shutdown.subscribe()));

        tracing::info!(
            addr = %local_addr,
            name = session.peer_name(),
            root = %hex::encode(session.local_root()),
            "node started"
        );

        Ok(Self {
            local_addr,
            session,
            exchange,
            peers,
            hellos,
            link_task,
            responder_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn subscribe_hellos(&self) -> broadcast::Receiver<HelloEvent> {
        self.hellos.subscribe()
    }

    pub fn registrar(&self, server: SocketAddr, policy: RegistrationPolicy) -> Registrar {
        Registrar::new(self.exchange.clone(), server, policy)
    }

    pub fn traversal<D: PeerDirectory>(
        &self,
        directory: D,
        server: SocketAddr,
        policy: NatPolicy,
    ) -> NatTraversal<D> {
        NatTraversal::new(self.exchange.clone(), directory, server, self.hellos.clone(), policy)
    }

    /// Datum source for the peer at `addr`.
    pub fn remote(&self, addr: SocketAddr) -> RemotePeer {
        RemotePeer::new(self.exchange.clone(), addr)
    }

    /// Wait for both tasks to stop, which they do on shutdown.
    pub async fn join(self) -> Result<()> {
        self.link_task.await.context("link task panicked")??;
        self.responder_task.await.context("responder task panicked")??;
        Ok(())
    }
}

/// Local address to bind for talking to `server`.
///
/// An unspecified configured address is switched to the server's address
/// family; anything more specific is used as given.
pub fn bind_addr_for(configured: &str, server: SocketAddr) -> Result<SocketAddr> {
    let addr: SocketAddr = configured
        .parse()
        .with_context(|| format!("invalid bind address {configured:?}"))?;
    if !addr.ip().is_unspecified() || addr.is_ipv4() == server.is_ipv4() {
        return Ok(addr);
    }
    let ip = match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    Ok(SocketAddr::new(ip, addr.port()))
}
