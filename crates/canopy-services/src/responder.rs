//! Responder — answers every unsolicited request that reaches the socket.
//!
//! Besides serving the local content tree, the responder is where the
//! server side of registration happens: the rendezvous server's PublicKey
//! and Root requests are answered here, and each moves the session's
//! registration state forward.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use canopy_core::crypto::PublicKey;
use canopy_core::wire::{self, Frame, Hello, MessageType, TraversalHint};
use canopy_core::{ContentTree, Hash};

use crate::link::Inbound;
use crate::peer::{self, PeerTable};
use crate::session::{RegistrationState, Session};

/// A Hello from someone, as seen by the responder.
#[derive(Debug, Clone)]
pub struct HelloEvent {
    pub from: SocketAddr,
    pub name: String,
}

pub struct Responder {
    socket: Arc<UdpSocket>,
    session: Arc<Session>,
    tree: Option<Arc<ContentTree>>,
    peers: PeerTable,
    hellos: broadcast::Sender<HelloEvent>,
}

impl Responder {
    pub fn new(
        socket: Arc<UdpSocket>,
        session: Arc<Session>,
        tree: Option<Arc<ContentTree>>,
        peers: PeerTable,
    ) -> Self {
        let (hellos, _) = broadcast::channel(16);
        Self {
            socket,
            session,
            tree,
            peers,
            hellos,
        }
    }

    /// Sender side of the Hello feed; `subscribe()` on it to watch greetings.
    pub fn hello_events(&self) -> broadcast::Sender<HelloEvent> {
        self.hellos.clone()
    }

    pub async fn run(
        self,
        mut requests: mpsc::Receiver<Inbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("responder shutting down");
                    return Ok(());
                }

                inbound = requests.recv() => {
                    let Some(inbound) = inbound else {
                        tracing::info!("request queue closed");
                        return Ok(());
                    };
                    self.handle(inbound).await;
                }
            }
        }
    }

    /// Answer one request, sending whatever it calls for.
    pub async fn handle(&self, inbound: Inbound) {
        let Inbound { frame, from } = inbound;
        if frame.msg_type == MessageType::NatTraversal {
            self.relay(&frame, from).await;
            return;
        }
        let Some(reply) = self.answer(&frame, from) else {
            return;
        };
        self.send(&reply, from).await;
    }

    /// The direct reply to `frame`, if it gets one.
    pub fn answer(&self, frame: &Frame, from: SocketAddr) -> Option<Frame> {
        match frame.msg_type {
            MessageType::NoOp => None,

            MessageType::Error => {
                tracing::warn!(
                    peer = %from,
                    message = %String::from_utf8_lossy(&frame.body),
                    "peer reported error"
                );
                Some(frame.reply(MessageType::ErrorReply, Vec::new()))
            }

            MessageType::Hello => match Hello::decode(&frame.body) {
                Ok(hello) => {
                    tracing::debug!(peer = %from, name = %hello.name, "hello");
                    peer::record_hello(&self.peers, from, &hello.name);
                    let _ = self.hellos.send(HelloEvent {
                        from,
                        name: hello.name.clone(),
                    });
                    Some(frame.reply(MessageType::HelloReply, hello.encode()))
                }
                Err(e) => Some(error_reply(frame, &e.to_string())),
            },

            MessageType::PublicKey => {
                if self.session.is_server(from) {
                    let key = PublicKey::from_slice(&frame.body);
                    self.session.record_server_key(key);
                    self.session.advance(
                        &[RegistrationState::Init, RegistrationState::HelloSent],
                        RegistrationState::KeyReceived,
                    );
                    tracing::info!(
                        server = %from,
                        key = %key.map(|k| k.to_hex()).unwrap_or_else(|| "none".into()),
                        "server key received"
                    );
                }
                let body = self
                    .session
                    .public_key()
                    .map(|k| k.as_bytes().to_vec())
                    .unwrap_or_default();
                Some(frame.reply(MessageType::PublicKeyReply, body))
            }

            MessageType::Root => {
                if let Ok(remote) = wire::read_hash(&frame.body) {
                    if self.session.is_server(from) {
                        self.session.record_server_root(remote);
                    }
                    tracing::debug!(peer = %from, root = %hex::encode(remote), "root announced");
                }
                if self.session.is_server(from) {
                    self.session.advance(
                        &[
                            RegistrationState::Init,
                            RegistrationState::HelloSent,
                            RegistrationState::KeyReceived,
                        ],
                        RegistrationState::RootExchanged,
                    );
                }
                let local = self.session.local_root();
                Some(frame.reply(MessageType::RootReply, local.to_vec()))
            }

            MessageType::GetDatum => match wire::read_hash(&frame.body) {
                Ok(hash) => Some(self.datum_reply(frame.id, &hash)),
                Err(e) => Some(error_reply(frame, &e.to_string())),
            },

            MessageType::NatTraversalRequest => {
                Some(error_reply(frame, "NatTraversalRequest is for the rendezvous server"))
            }

            // Relays are handled in `handle`; replies never reach the responder.
            MessageType::NatTraversal
            | MessageType::ErrorReply
            | MessageType::HelloReply
            | MessageType::PublicKeyReply
            | MessageType::RootReply
            | MessageType::Datum
            | MessageType::NoDatum => None,
        }
    }

    /// Datum or NoDatum for `hash`, carrying `id`.
    pub fn datum_reply(&self, id: u32, hash: &Hash) -> Frame {
        let datum = match &self.tree {
            Some(tree) => tree.datum(hash).unwrap_or_else(|e| {
                tracing::warn!(hash = %hex::encode(hash), error = %e, "lookup failed");
                None
            }),
            None => None,
        };
        match datum {
            Some(datum) => {
                tracing::debug!(hash = %hex::encode(hash), kind = ?datum.kind(), "serving datum");
                Frame::new(id, MessageType::Datum, wire::encode_datum_body(hash, &datum))
            }
            None => Frame::new(id, MessageType::NoDatum, hash.to_vec()),
        }
    }

    /// The server introduces a peer that wants to reach us.
    ///
    /// We Hello the peer from our own socket so our NAT admits its traffic,
    /// and when the relay names a hash, push that datum to the peer from a
    /// separate ephemeral socket.
    async fn relay(&self, frame: &Frame, from: SocketAddr) {
        let hint = match TraversalHint::decode(&frame.body) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "bad traversal hint");
                self.send(&error_reply(frame, &e.to_string()), from).await;
                return;
            }
        };
        tracing::info!(relay = %from, peer = %hint.addr, "traversal requested");

        let hello = Frame::new(
            self.session.next_id(),
            MessageType::Hello,
            Hello::new(self.session.peer_name()).encode(),
        );
        self.send(&hello, hint.addr).await;

        if let Some(hash) = hint.hash {
            let reply = self.datum_reply(frame.id, &hash);
            if let Err(e) = push_ephemeral(&reply, hint.addr).await {
                tracing::warn!(peer = %hint.addr, error = %e, "relay push failed");
            }
        }
    }

    async fn send(&self, frame: &Frame, to: SocketAddr) {
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(peer = %to, error = %e, "reply does not encode");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            tracing::warn!(peer = %to, error = %e, "send_to failed");
        }
    }
}

async fn push_ephemeral(frame: &Frame, to: SocketAddr) -> Result<()> {
    let bind: SocketAddr = match to {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(to).await?;
    socket.send(&frame.encode()?).await?;
    Ok(())
}

fn error_reply(frame: &Frame, message: &str) -> Frame {
    frame.reply(MessageType::Error, message.as_bytes().to_vec())
}
