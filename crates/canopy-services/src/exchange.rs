//! Reliable request/response over one UDP socket.
//!
//! Every request takes a fresh id from the [`Session`]; a reply counts only
//! if it echoes that id. Requests are serialized: the reply queue is held for
//! the whole cycle, so at most one request is outstanding per socket.
//!
//! Two policies:
//!   - handshake-class requests (Hello, Root, ...) wait a fixed time per
//!     attempt and are retried a bounded number of times, each attempt with
//!     a new id;
//!   - GetDatum runs against an overall deadline made of short reads; each
//!     read timeout re-sends the same frame.
//!
//! Datum replies pass the integrity pipeline in [`verify_datum`] before the
//! caller sees them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use canopy_core::config::ExchangeConfig;
use canopy_core::wire::{self, Datum, Frame, Hello, MessageType};
use canopy_core::Hash;

use crate::error::{ExchangeError, IntegrityViolation};
use crate::link::Inbound;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct ExchangePolicy {
    pub handshake_timeout: Duration,
    pub handshake_retries: u32,
    pub datum_deadline: Duration,
    pub datum_read_timeout: Duration,
}

impl Default for ExchangePolicy {
    fn default() -> Self {
        Self::from(&ExchangeConfig::default())
    }
}

impl From<&ExchangeConfig> for ExchangePolicy {
    fn from(config: &ExchangeConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            handshake_retries: config.handshake_retries.max(1),
            datum_deadline: config.datum_deadline(),
            datum_read_timeout: config.datum_read_timeout(),
        }
    }
}

/// Answer to a GetDatum that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatumOutcome {
    Found(Datum),
    /// The peer answered NoDatum.
    Absent,
}

pub struct Exchange {
    socket: Arc<UdpSocket>,
    session: Arc<Session>,
    policy: ExchangePolicy,
    replies: Mutex<mpsc::Receiver<Inbound>>,
}

impl Exchange {
    pub fn new(
        socket: Arc<UdpSocket>,
        session: Arc<Session>,
        replies: mpsc::Receiver<Inbound>,
        policy: ExchangePolicy,
    ) -> Self {
        Self {
            socket,
            session,
            policy,
            replies: Mutex::new(replies),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn policy(&self) -> &ExchangePolicy {
        &self.policy
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a request without waiting for anything. Returns its id.
    pub async fn notify(
        &self,
        addr: SocketAddr,
        msg_type: MessageType,
        body: impl Into<Bytes>,
    ) -> Result<u32, ExchangeError> {
        let frame = Frame::new(self.session.next_id(), msg_type, body);
        self.send(&frame, addr).await?;
        Ok(frame.id)
    }

    /// Handshake-class request with the configured retry budget.
    pub async fn request(
        &self,
        addr: SocketAddr,
        msg_type: MessageType,
        body: impl Into<Bytes>,
        expect: MessageType,
    ) -> Result<Frame, ExchangeError> {
        self.request_with(addr, msg_type, body, expect, self.policy.handshake_retries)
            .await
    }

    /// Handshake-class request with an explicit attempt count.
    ///
    /// A reply of the wrong type, or no reply within the per-attempt timeout,
    /// moves on to the next attempt. ErrorReply ends the call.
    pub async fn request_with(
        &self,
        addr: SocketAddr,
        msg_type: MessageType,
        body: impl Into<Bytes>,
        expect: MessageType,
        attempts: u32,
    ) -> Result<Frame, ExchangeError> {
        let body = body.into();
        let attempts = attempts.max(1);
        let mut replies = self.replies.lock().await;
        let mut last_err = ExchangeError::Timeout { attempts };

        for attempt in 1..=attempts {
            let frame = Frame::new(self.session.next_id(), msg_type, body.clone());
            self.send(&frame, addr).await?;
            tracing::debug!(peer = %addr, id = frame.id, ?msg_type, attempt, "request sent");

            let until = Instant::now() + self.policy.handshake_timeout;
            loop {
                let inbound = match tokio::time::timeout_at(until, replies.recv()).await {
                    Err(_) => {
                        tracing::warn!(peer = %addr, ?msg_type, attempt, attempts, "no reply");
                        break;
                    }
                    Ok(None) => return Err(ExchangeError::Closed),
                    Ok(Some(inbound)) => inbound,
                };
                if inbound.frame.id != frame.id {
                    tracing::trace!(peer = %inbound.from, id = inbound.frame.id, "discarding stale reply");
                    continue;
                }
                let got = inbound.frame.msg_type;
                match got {
                    t if t == expect => return Ok(inbound.frame),
                    MessageType::ErrorReply => return Err(remote_error(&inbound.frame)),
                    got => {
                        tracing::warn!(peer = %addr, ?expect, ?got, attempt, "unexpected reply type");
                        last_err = ExchangeError::Protocol { expected: expect, got };
                        break;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Hello → HelloReply.
    pub async fn hello(&self, addr: SocketAddr) -> Result<Hello, ExchangeError> {
        let body = Hello::new(self.session.peer_name()).encode();
        let reply = self
            .request(addr, MessageType::Hello, body, MessageType::HelloReply)
            .await?;
        Ok(Hello::decode(&reply.body)?)
    }

    /// Announce our root and learn the peer's.
    pub async fn root(&self, addr: SocketAddr) -> Result<Hash, ExchangeError> {
        let local = self.session.local_root();
        let reply = self
            .request(addr, MessageType::Root, local.to_vec(), MessageType::RootReply)
            .await?;
        Ok(wire::read_hash(&reply.body)?)
    }

    /// Fetch and verify the datum for `hash`.
    pub async fn get_datum(&self, addr: SocketAddr, hash: &Hash) -> Result<DatumOutcome, ExchangeError> {
        let mut replies = self.replies.lock().await;
        let frame = Frame::new(self.session.next_id(), MessageType::GetDatum, hash.to_vec());
        let bytes = frame.encode()?;
        let deadline = Instant::now() + self.policy.datum_deadline;

        self.socket.send_to(&bytes, addr).await?;
        tracing::debug!(peer = %addr, id = frame.id, hash = %hex::encode(hash), "datum requested");

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ExchangeError::DeadlineExceeded(self.policy.datum_deadline));
            }
            let read_until = (now + self.policy.datum_read_timeout).min(deadline);
            let inbound = match tokio::time::timeout_at(read_until, replies.recv()).await {
                Err(_) => {
                    if Instant::now() < deadline {
                        tracing::debug!(peer = %addr, id = frame.id, "datum read timed out, re-sending");
                        self.socket.send_to(&bytes, addr).await?;
                    }
                    continue;
                }
                Ok(None) => return Err(ExchangeError::Closed),
                Ok(Some(inbound)) => inbound,
            };
            if inbound.frame.id != frame.id {
                tracing::trace!(peer = %inbound.from, id = inbound.frame.id, "discarding stale reply");
                continue;
            }
            return match inbound.frame.msg_type {
                MessageType::Datum => verify_datum(hash, &inbound.frame.body).map(DatumOutcome::Found),
                MessageType::NoDatum => {
                    let echoed = wire::read_hash(&inbound.frame.body)?;
                    if echoed != *hash {
                        return Err(IntegrityViolation::EchoMismatch {
                            requested: *hash,
                            echoed,
                        }
                        .into());
                    }
                    Ok(DatumOutcome::Absent)
                }
                MessageType::ErrorReply => Err(remote_error(&inbound.frame)),
                got => Err(ExchangeError::Protocol {
                    expected: MessageType::Datum,
                    got,
                }),
            };
        }
    }

    async fn send(&self, frame: &Frame, addr: SocketAddr) -> Result<(), ExchangeError> {
        let bytes = frame.encode()?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }
}

/// Integrity pipeline for a Datum body answering a request for `requested`.
///
/// The echoed hash must equal the request, and the value must hash to it.
/// No kind is exempt: an empty directory digests to `crypto::empty_root()`
/// and is accepted only under that hash.
pub fn verify_datum(requested: &Hash, body: &[u8]) -> Result<Datum, ExchangeError> {
    let (echoed, value) = wire::split_datum_body(body)?;
    if echoed != *requested {
        return Err(IntegrityViolation::EchoMismatch {
            requested: *requested,
            echoed,
        }
        .into());
    }
    let datum = Datum::decode_value(value)?;
    let computed = datum.digest();
    if computed != *requested {
        return Err(IntegrityViolation::DigestMismatch {
            requested: *requested,
            computed,
        }
        .into());
    }
    Ok(datum)
}

fn remote_error(frame: &Frame) -> ExchangeError {
    ExchangeError::Remote(String::from_utf8_lossy(&frame.body).into_owned())
}
