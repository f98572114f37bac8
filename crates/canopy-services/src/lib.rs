//! canopy-services — the networked half of a Canopy peer.
//!
//! A [`node::Node`] owns one UDP socket. The [`link::Link`] pumps it, the
//! [`responder::Responder`] answers requests, and the [`exchange::Exchange`]
//! issues our own requests. Registration, NAT traversal, the HTTP directory
//! and the download engine are built on top of those.

pub mod directory;
pub mod download;
pub mod error;
pub mod exchange;
pub mod link;
pub mod nat;
pub mod node;
pub mod peer;
pub mod registration;
pub mod responder;
pub mod session;

pub use directory::{DirectoryError, HttpDirectory, PeerDirectory};
pub use download::{DownloadEngine, DownloadReport, DownloadRequest, Mode};
pub use error::{ExchangeError, IntegrityViolation};
pub use exchange::{DatumOutcome, Exchange, ExchangePolicy};
pub use nat::{NatPolicy, NatTraversal, Traversal};
pub use node::{bind_addr_for, Node};
pub use registration::{Registrar, RegistrationPolicy};
pub use session::{RegistrationState, Session};
