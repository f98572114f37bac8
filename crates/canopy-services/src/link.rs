//! Socket pump — the only reader of a session's UDP socket.
//!
//! Every datagram is decoded once and routed by type: replies go to the
//! exchange waiting on them, requests go to the responder. Malformed
//! datagrams are logged and dropped; a frame with an unknown type tag is
//! answered with an Error carrying its id.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use canopy_core::wire::{Frame, MessageType, WireError, DATAGRAM_SIZE};

/// Queue depth of each routed channel. Overflow drops the datagram.
const CHANNEL_DEPTH: usize = 64;

/// A decoded frame and who sent it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub frame: Frame,
    pub from: SocketAddr,
}

/// Receiving ends of a [`Link`].
pub struct LinkChannels {
    pub replies: mpsc::Receiver<Inbound>,
    pub requests: mpsc::Receiver<Inbound>,
}

pub struct Link {
    socket: Arc<UdpSocket>,
    replies: mpsc::Sender<Inbound>,
    requests: mpsc::Sender<Inbound>,
    shutdown: broadcast::Receiver<()>,
}

impl Link {
    pub fn new(socket: Arc<UdpSocket>, shutdown: broadcast::Receiver<()>) -> (Self, LinkChannels) {
        let (replies_tx, replies_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_DEPTH);
        let link = Self {
            socket,
            replies: replies_tx,
            requests: requests_tx,
            shutdown,
        };
        let channels = LinkChannels {
            replies: replies_rx,
            requests: requests_rx,
        };
        (link, channels)
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("link shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.route(&buf[..len], from).await;
                }
            }
        }
    }

    async fn route(&self, datagram: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(datagram) {
            Ok(f) => f,
            Err(WireError::UnknownType { id, tag }) => {
                tracing::warn!(peer = %from, id, tag, "unknown message type");
                let body = format!("unknown message type {tag}");
                let reply = Frame::new(id, MessageType::Error, body.into_bytes());
                if let Ok(bytes) = reply.encode() {
                    if let Err(e) = self.socket.send_to(&bytes, from).await {
                        tracing::warn!(peer = %from, error = %e, "failed to send error reply");
                    }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %from, len = datagram.len(), error = %e, "discarding malformed datagram");
                return;
            }
        };

        tracing::trace!(peer = %from, id = frame.id, msg_type = ?frame.msg_type, "datagram received");
        let queue = if frame.is_reply() {
            &self.replies
        } else {
            &self.requests
        };
        if let Err(e) = queue.try_send(Inbound { frame, from }) {
            tracing::warn!(peer = %from, error = %e, "dropping datagram, queue unavailable");
        }
    }
}
