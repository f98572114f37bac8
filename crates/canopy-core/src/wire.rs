//! Canopy wire format — on-wire types for all peer and server traffic.
//!
//! These types ARE the protocol. Every datagram is
//!
//! ```text
//!   id(4) | type(1) | length(2) | value(length) | signature(64)
//! ```
//!
//! with big-endian integers. The header is a zerocopy struct; bodies are
//! encoded by the helpers below. The signature region is reserved: it is
//! always emitted as zeros and never inspected on receipt, and a frame that
//! omits it entirely is still accepted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{self, Hash, HASH_LEN};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Fixed prefix of every datagram.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Request id. A reply carries the id of the request it answers.
    pub id: U32<BigEndian>,

    /// Message type tag, see [`MessageType`].
    pub msg_type: u8,

    /// Number of value bytes following the header.
    pub length: U16<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 7]);

// ── Message Type ──────────────────────────────────────────────────────────────

/// Message type tag. Requests live below 128, replies at 128 and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    NoOp = 0,
    Error = 1,
    Hello = 2,
    PublicKey = 3,
    Root = 4,
    GetDatum = 5,
    NatTraversalRequest = 6,
    NatTraversal = 7,

    ErrorReply = 128,
    HelloReply = 129,
    PublicKeyReply = 130,
    RootReply = 131,
    Datum = 132,
    NoDatum = 133,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::NoOp,
            1 => Self::Error,
            2 => Self::Hello,
            3 => Self::PublicKey,
            4 => Self::Root,
            5 => Self::GetDatum,
            6 => Self::NatTraversalRequest,
            7 => Self::NatTraversal,
            128 => Self::ErrorReply,
            129 => Self::HelloReply,
            130 => Self::PublicKeyReply,
            131 => Self::RootReply,
            132 => Self::Datum,
            133 => Self::NoDatum,
            _ => return None,
        })
    }

    /// Replies answer an outstanding request; everything else is unsolicited.
    pub fn is_reply(self) -> bool {
        self as u8 >= 128
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Node Kind ─────────────────────────────────────────────────────────────────

/// Leading byte of a datum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatumKind {
    /// Raw content bytes, at most one chunk.
    Chunk = 0,
    /// Ordered 32-byte hashes of the file's children.
    BigFile = 1,
    /// Repeated (32-byte zero-padded name, 32-byte hash) records.
    Directory = 2,
}

impl TryFrom<u8> for DatumKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DatumKind::Chunk),
            1 => Ok(DatumKind::BigFile),
            2 => Ok(DatumKind::Directory),
            other => Err(WireError::UnknownNodeKind(other)),
        }
    }
}

impl From<DatumKind> for u8 {
    fn from(k: DatumKind) -> u8 {
        k as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the fixed header.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Size of the trailing reserved signature region.
pub const SIGNATURE_LEN: usize = 64;

/// Receive buffer size. No datagram we send is larger.
pub const DATAGRAM_SIZE: usize = 2048;

/// Largest value that fits in a datagram alongside header and signature.
pub const MAX_BODY: usize = DATAGRAM_SIZE - HEADER_LEN - SIGNATURE_LEN;

/// File content is cut into chunks of this many bytes.
pub const CHUNK_SIZE: usize = 1024;

/// Fan-out bound of a BigFile node.
pub const MAX_CHILDREN: usize = 32;

/// Directories keep only this many listing entries.
pub const MAX_DIRECTORY_ENTRIES: usize = 16;

/// Directory entry names are zero-padded to this many bytes.
pub const NAME_LEN: usize = 32;

/// One directory record: name then hash.
pub const DIRECTORY_RECORD_LEN: usize = NAME_LEN + HASH_LEN;

/// Hello extension bits we advertise. None are defined.
pub const HELLO_EXTENSIONS: u32 = 0;

// ── Frames ────────────────────────────────────────────────────────────────────

/// One decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub msg_type: MessageType,
    pub body: Bytes,
}

impl Frame {
    pub fn new(id: u32, msg_type: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            msg_type,
            body: body.into(),
        }
    }

    /// A frame answering this one: same id, new type and body.
    pub fn reply(&self, msg_type: MessageType, body: impl Into<Bytes>) -> Self {
        Self::new(self.id, msg_type, body)
    }

    pub fn is_reply(&self) -> bool {
        self.msg_type.is_reply()
    }

    /// Serialize header, body and a zeroed signature region.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.body.len() > MAX_BODY {
            return Err(WireError::BodyTooLarge(self.body.len()));
        }
        let header = FrameHeader {
            id: U32::new(self.id),
            msg_type: self.msg_type.into(),
            length: U16::new(self.body.len() as u16),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len() + SIGNATURE_LEN);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.body);
        out.resize(out.len() + SIGNATURE_LEN, 0);
        Ok(out)
    }

    /// Parse one datagram.
    ///
    /// The declared length must account for every byte after the header,
    /// either alone or followed by exactly one signature region.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let header =
            FrameHeader::read_from_prefix(datagram).ok_or(WireError::Truncated(datagram.len()))?;
        let id = header.id.get();
        let declared = header.length.get() as usize;
        let present = datagram.len() - HEADER_LEN;
        if present != declared && present != declared + SIGNATURE_LEN {
            return Err(WireError::LengthMismatch { declared, present });
        }
        let msg_type = MessageType::from_tag(header.msg_type).ok_or(WireError::UnknownType {
            id,
            tag: header.msg_type,
        })?;
        let body = Bytes::copy_from_slice(&datagram[HEADER_LEN..HEADER_LEN + declared]);
        Ok(Self { id, msg_type, body })
    }
}

// ── Hello ─────────────────────────────────────────────────────────────────────

/// Body of Hello and HelloReply: extension bits then the peer name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub extensions: u32,
    pub name: String,
}

impl Hello {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            extensions: HELLO_EXTENSIONS,
            name: name.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.name.len());
        out.extend_from_slice(&self.extensions.to_be_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < 4 {
            return Err(WireError::MalformedHello(body.len()));
        }
        let extensions = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let name = String::from_utf8_lossy(&body[4..]).into_owned();
        Ok(Self { extensions, name })
    }
}

// ── Datums ────────────────────────────────────────────────────────────────────

/// One (name, hash) record of a directory datum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub hash: Hash,
}

impl DirectoryEntry {
    /// A name that can be joined onto a local directory without escaping it.
    pub fn is_safe_name(&self) -> bool {
        !self.name.is_empty()
            && self.name != "."
            && self.name != ".."
            && !self.name.contains(['/', '\\', '\0'])
    }
}

/// Decoded datum value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    Chunk(Bytes),
    BigFile(Vec<Hash>),
    Directory(Vec<DirectoryEntry>),
}

impl Datum {
    pub fn kind(&self) -> DatumKind {
        match self {
            Datum::Chunk(_) => DatumKind::Chunk,
            Datum::BigFile(_) => DatumKind::BigFile,
            Datum::Directory(_) => DatumKind::Directory,
        }
    }

    /// The hash this datum commits to.
    ///
    /// A chunk commits to its bytes; a big file or directory commits to its
    /// children's hashes in order. Directory names are not covered.
    pub fn digest(&self) -> Hash {
        match self {
            Datum::Chunk(bytes) => crypto::hash(bytes),
            Datum::BigFile(children) => crypto::hash_concat(children),
            Datum::Directory(entries) => crypto::hash_concat(entries.iter().map(|e| &e.hash)),
        }
    }

    /// Leading kind byte followed by the kind-specific payload.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut out = vec![u8::from(self.kind())];
        match self {
            Datum::Chunk(bytes) => out.extend_from_slice(bytes),
            Datum::BigFile(children) => {
                for child in children {
                    out.extend_from_slice(child);
                }
            }
            Datum::Directory(entries) => {
                for entry in entries {
                    out.extend_from_slice(&encode_name(&entry.name));
                    out.extend_from_slice(&entry.hash);
                }
            }
        }
        out
    }

    pub fn decode_value(value: &[u8]) -> Result<Self, WireError> {
        let (&tag, payload) = value
            .split_first()
            .ok_or(WireError::MalformedDatum("empty value"))?;
        match DatumKind::try_from(tag)? {
            DatumKind::Chunk => {
                if payload.len() > CHUNK_SIZE {
                    return Err(WireError::MalformedDatum("chunk larger than chunk size"));
                }
                Ok(Datum::Chunk(Bytes::copy_from_slice(payload)))
            }
            DatumKind::BigFile => {
                if payload.is_empty() || payload.len() % HASH_LEN != 0 {
                    return Err(WireError::MalformedDatum("big file payload is not a hash list"));
                }
                if payload.len() / HASH_LEN > MAX_CHILDREN {
                    return Err(WireError::MalformedDatum("big file has too many children"));
                }
                let children = payload
                    .chunks_exact(HASH_LEN)
                    .map(|c| {
                        let mut h = [0u8; HASH_LEN];
                        h.copy_from_slice(c);
                        h
                    })
                    .collect();
                Ok(Datum::BigFile(children))
            }
            DatumKind::Directory => {
                if payload.len() % DIRECTORY_RECORD_LEN != 0 {
                    return Err(WireError::MalformedDatum("directory payload is not a record list"));
                }
                let entries = payload
                    .chunks_exact(DIRECTORY_RECORD_LEN)
                    .map(|record| {
                        let mut hash = [0u8; HASH_LEN];
                        hash.copy_from_slice(&record[NAME_LEN..]);
                        DirectoryEntry {
                            name: decode_name(&record[..NAME_LEN]),
                            hash,
                        }
                    })
                    .collect();
                Ok(Datum::Directory(entries))
            }
        }
    }
}

/// Datum body: the hash being answered, then the encoded value.
pub fn encode_datum_body(hash: &Hash, datum: &Datum) -> Vec<u8> {
    let value = datum.encode_value();
    let mut out = Vec::with_capacity(HASH_LEN + value.len());
    out.extend_from_slice(hash);
    out.extend_from_slice(&value);
    out
}

/// Split a Datum body into the echoed hash and the value bytes.
pub fn split_datum_body(body: &[u8]) -> Result<(Hash, &[u8]), WireError> {
    let echoed = read_hash(body)?;
    Ok((echoed, &body[HASH_LEN..]))
}

/// First 32 bytes of a body as a hash (GetDatum, NoDatum, Root, RootReply).
pub fn read_hash(body: &[u8]) -> Result<Hash, WireError> {
    body.get(..HASH_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(WireError::MissingHash(body.len()))
}

/// Zero-pad (or cut, on a character boundary) a name to the record width.
pub fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut end = name.len().min(NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = [0u8; NAME_LEN];
    out[..end].copy_from_slice(&name.as_bytes()[..end]);
    out
}

fn decode_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ── NAT address records ───────────────────────────────────────────────────────

/// Encode an endpoint as 4+2 (IPv4) or 16+2 (IPv6) bytes.
pub fn encode_addr(addr: SocketAddr) -> Vec<u8> {
    let mut out = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => v4.octets().to_vec(),
            None => ip.octets().to_vec(),
        },
    };
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decode a bare 6- or 18-byte address record.
pub fn decode_addr(record: &[u8]) -> Result<SocketAddr, WireError> {
    let (ip, port) = match record.len() {
        6 => {
            let octets: [u8; 4] = [record[0], record[1], record[2], record[3]];
            (IpAddr::V4(Ipv4Addr::from(octets)), &record[4..])
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&record[..16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), &record[16..])
        }
        other => return Err(WireError::BadAddressRecord(other)),
    };
    Ok(SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]])))
}

/// Body of a relayed NatTraversal: the peer's address, optionally followed
/// by the hash of a datum to push to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalHint {
    pub addr: SocketAddr,
    pub hash: Option<Hash>,
}

impl TraversalHint {
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        match body.len() {
            6 | 18 => Ok(Self {
                addr: decode_addr(body)?,
                hash: None,
            }),
            38 | 50 => {
                let split = body.len() - HASH_LEN;
                Ok(Self {
                    addr: decode_addr(&body[..split])?,
                    hash: Some(read_hash(&body[split..])?),
                })
            }
            other => Err(WireError::BadAddressRecord(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = encode_addr(self.addr);
        if let Some(hash) = &self.hash {
            out.extend_from_slice(hash);
        }
        out
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("declared length {declared} does not match {present} bytes present")]
    LengthMismatch { declared: usize, present: usize },

    #[error("unknown message type 0x{tag:02x} (id {id})")]
    UnknownType { id: u32, tag: u8 },

    #[error("body of {0} bytes exceeds maximum {}", MAX_BODY)]
    BodyTooLarge(usize),

    #[error("unknown node kind byte: 0x{0:02x}")]
    UnknownNodeKind(u8),

    #[error("malformed datum: {0}")]
    MalformedDatum(&'static str),

    #[error("hello body of {0} bytes is too short")]
    MalformedHello(usize),

    #[error("body of {0} bytes does not start with a hash")]
    MissingHash(usize),

    #[error("address record of {0} bytes is neither IPv4 nor IPv6")]
    BadAddressRecord(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
