//! canopy-core — content tree, wire format, hashing and configuration.
//! All other Canopy crates depend on this one.

pub mod config;
pub mod crypto;
pub mod tree;
pub mod wire;

pub use crypto::Hash;
pub use tree::{ContentTree, NodeKind, TreeNode};
pub use wire::{Datum, Frame, MessageType};
