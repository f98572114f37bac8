//! Hashing primitives for Canopy.
//!
//! Content is addressed by SHA-256. A chunk is named by the digest of its
//! bytes, an interior node by the digest of its children's digests laid end
//! to end. Public keys are carried as opaque 64-byte blobs; signing and
//! verification live outside this crate.

use sha2::{Digest, Sha256};

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = 32;

/// Length of a raw P-256 public key (X || Y) as published by the directory.
pub const PUBLIC_KEY_LEN: usize = 64;

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; HASH_LEN];

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte SHA-256 digest.
pub fn hash(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Digest of an ordered run of child hashes.
///
/// Reordering the input changes the output; interior nodes depend on it.
pub fn hash_concat<'a, I>(hashes: I) -> Hash
where
    I: IntoIterator<Item = &'a Hash>,
{
    let mut h = Hasher::new();
    for child in hashes {
        h.update(child);
    }
    h.finalize()
}

/// Root announced by a peer that shares nothing: sha256 of the empty string.
pub fn empty_root() -> Hash {
    hash(b"")
}

/// Incremental SHA-256 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use canopy_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, canopy_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Hash {
        self.0.finalize().into()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a 64-character hex string into a hash.
pub fn parse_hash(text: &str) -> Option<Hash> {
    let bytes = hex::decode(text.trim()).ok()?;
    bytes.try_into().ok()
}

// ── Public keys ───────────────────────────────────────────────────────────────

/// Opaque public key learned from the directory or during registration.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns `None` unless `bytes` is exactly 64 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..8]))
    }
}
