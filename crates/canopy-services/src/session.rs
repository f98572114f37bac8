//! Session state — one per local socket.
//!
//! Owns the request-id counter, the keys and roots learned while
//! registering, and the registration state. The state lives in a watch
//! channel: the Responder advances it when the server's PublicKey and Root
//! requests arrive, and the Registrar waits on it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;

use canopy_core::crypto::{self, PublicKey};
use canopy_core::Hash;

/// Registration progress against the rendezvous server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistrationState {
    Init,
    HelloSent,
    KeyReceived,
    RootExchanged,
    Active,
    /// Keep-alive went unanswered; re-registration starts from Init.
    Lost,
}

impl RegistrationState {
    /// The server has seen our root; Datum traffic may flow.
    pub fn is_established(self) -> bool {
        matches!(self, Self::RootExchanged | Self::Active)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::HelloSent => "hello-sent",
            Self::KeyReceived => "key-received",
            Self::RootExchanged => "root-exchanged",
            Self::Active => "active",
            Self::Lost => "lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Learned {
    server: Option<SocketAddr>,
    server_key: Option<PublicKey>,
    server_root: Option<Hash>,
}

pub struct Session {
    peer_name: String,
    local_root: Hash,
    public_key: Option<PublicKey>,
    counter: AtomicU32,
    state: watch::Sender<RegistrationState>,
    learned: Mutex<Learned>,
}

impl Session {
    /// `local_root` is the root of the shared tree, if any.
    pub fn new(peer_name: impl Into<String>, local_root: Option<Hash>) -> Self {
        let (state, _) = watch::channel(RegistrationState::Init);
        Self {
            peer_name: peer_name.into(),
            local_root: local_root.unwrap_or_else(crypto::empty_root),
            public_key: None,
            counter: AtomicU32::new(rand::random()),
            state,
            learned: Mutex::new(Learned::default()),
        }
    }

    /// Key answered to PublicKey requests. Without one the reply is empty.
    pub fn with_public_key(mut self, key: PublicKey) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn local_root(&self) -> Hash {
        self.local_root
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_key
    }

    /// A fresh request id. Wraps at u32::MAX.
    pub fn next_id(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    // ── Registration state ───────────────────────────────────────────────────

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, next: RegistrationState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "registration state");
        }
    }

    /// Move to `next` only if the current state is one of `from`.
    pub fn advance(&self, from: &[RegistrationState], next: RegistrationState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(to = %next, "registration state");
        }
        moved
    }

    // ── Learned from the server ──────────────────────────────────────────────

    pub fn set_server(&self, addr: SocketAddr) {
        self.learned().server = Some(addr);
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.learned().server
    }

    pub fn is_server(&self, addr: SocketAddr) -> bool {
        self.server() == Some(addr)
    }

    pub fn record_server_key(&self, key: Option<PublicKey>) {
        self.learned().server_key = key;
    }

    pub fn server_key(&self) -> Option<PublicKey> {
        self.learned().server_key
    }

    pub fn record_server_root(&self, root: Hash) {
        self.learned().server_root = Some(root);
    }

    pub fn server_root(&self) -> Option<Hash> {
        self.learned().server_root
    }

    fn learned(&self) -> std::sync::MutexGuard<'_, Learned> {
        self.learned.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer_name", &self.peer_name)
            .field("local_root", &hex::encode(self.local_root))
            .field("state", &self.state())
            .finish()
    }
}
