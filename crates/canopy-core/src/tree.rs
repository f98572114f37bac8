//! Content tree — the hash tree a peer serves.
//!
//! A file is cut into 1024-byte chunks. One chunk (or none) makes a Chunk
//! node; more are folded into a B-tree of BigFile nodes with at most 32
//! children each. A directory hashes the ordered hashes of its first 16
//! entries; an empty directory hashes its own path string.
//!
//! Directory traversal runs on an explicit work stack with a depth limit,
//! so a deep or looping filesystem fails with [`TreeError::TooDeep`]
//! instead of exhausting the call stack.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::crypto::{self, Hash};
use crate::wire::{Datum, DatumKind, DirectoryEntry, CHUNK_SIZE, MAX_CHILDREN, MAX_DIRECTORY_ENTRIES, NAME_LEN};

/// Default limit on directory nesting while building.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// ── Nodes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TreeNode {
    /// File or directory base name; chunk leaves and interior B-tree nodes
    /// carry their index.
    pub name: String,
    pub hash: Hash,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A run of at most [`CHUNK_SIZE`] bytes of `source` starting at `offset`.
    Chunk {
        source: Arc<PathBuf>,
        offset: u64,
        len: usize,
    },
    BigFile {
        children: Vec<TreeNode>,
    },
    Directory {
        children: Vec<TreeNode>,
    },
}

impl TreeNode {
    pub fn children(&self) -> &[TreeNode] {
        match &self.kind {
            NodeKind::Chunk { .. } => &[],
            NodeKind::BigFile { children } | NodeKind::Directory { children } => children,
        }
    }

    pub fn datum_kind(&self) -> DatumKind {
        match self.kind {
            NodeKind::Chunk { .. } => DatumKind::Chunk,
            NodeKind::BigFile { .. } => DatumKind::BigFile,
            NodeKind::Directory { .. } => DatumKind::Directory,
        }
    }

    fn big_file(name: String, children: Vec<TreeNode>) -> Self {
        let hash = crypto::hash_concat(children.iter().map(|c| &c.hash));
        Self {
            name,
            hash,
            kind: NodeKind::BigFile { children },
        }
    }
}

// ── Building ──────────────────────────────────────────────────────────────────

/// Fold ordered chunk leaves into a bounded B-tree.
///
/// Up to [`MAX_CHILDREN`] leaves become the direct children of one BigFile
/// node. Beyond that the leaves are split into contiguous groups of
/// `ceil(n / 32)` and each group is folded the same way.
pub fn build_btree(leaves: Vec<TreeNode>) -> TreeNode {
    if leaves.len() <= MAX_CHILDREN {
        return TreeNode::big_file(String::new(), leaves);
    }
    let per_group = leaves.len().div_ceil(MAX_CHILDREN);
    let mut rest = leaves.into_iter();
    let mut groups = Vec::with_capacity(MAX_CHILDREN);
    loop {
        let group: Vec<TreeNode> = rest.by_ref().take(per_group).collect();
        if group.is_empty() {
            break;
        }
        let mut node = build_btree(group);
        node.name = groups.len().to_string();
        groups.push(node);
    }
    TreeNode::big_file(String::new(), groups)
}

/// Chunk a regular file and fold the chunks.
fn build_file(path: &Path, name: String) -> Result<TreeNode, TreeError> {
    let io_err = |source| TreeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let source = Arc::new(path.to_path_buf());
    let mut file = File::open(path).map_err(io_err)?;
    let mut leaves = Vec::new();
    let mut offset = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let len = read_full(&mut file, &mut buf).map_err(io_err)?;
        if len == 0 {
            break;
        }
        leaves.push(TreeNode {
            name: leaves.len().to_string(),
            hash: crypto::hash(&buf[..len]),
            kind: NodeKind::Chunk {
                source: source.clone(),
                offset,
                len,
            },
        });
        offset += len as u64;
        if len < CHUNK_SIZE {
            break;
        }
    }

    let mut node = match leaves.len() {
        0 => TreeNode {
            name: String::new(),
            hash: crypto::hash(b""),
            kind: NodeKind::Chunk {
                source,
                offset: 0,
                len: 0,
            },
        },
        1 => leaves.remove(0),
        _ => build_btree(leaves),
    };
    node.name = name;
    Ok(node)
}

/// Fill `buf` unless the file ends first. Returns bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// The first [`MAX_DIRECTORY_ENTRIES`] files and subdirectories, by name.
/// Names longer than a directory record holds are skipped, since a cut
/// name could collide with a sibling.
fn list_dir(path: &Path) -> Result<Vec<(String, PathBuf)>, TreeError> {
    let io_err = |source| TreeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let child = entry.path();
        match std::fs::metadata(&child) {
            Ok(meta) if meta.is_dir() || meta.is_file() => {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.len() > NAME_LEN {
                    tracing::warn!(path = %child.display(), max = NAME_LEN, "skipping entry with overlong name");
                    continue;
                }
                entries.push((name, child));
            }
            Ok(_) => tracing::debug!(path = %child.display(), "skipping special file"),
            Err(e) => tracing::warn!(path = %child.display(), error = %e, "skipping unreadable entry"),
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    if entries.len() > MAX_DIRECTORY_ENTRIES {
        tracing::debug!(
            path = %path.display(),
            kept = MAX_DIRECTORY_ENTRIES,
            dropped = entries.len() - MAX_DIRECTORY_ENTRIES,
            "directory listing capped"
        );
        entries.truncate(MAX_DIRECTORY_ENTRIES);
    }
    Ok(entries)
}

enum Task {
    Visit {
        path: PathBuf,
        name: String,
        depth: usize,
    },
    Seal {
        path: PathBuf,
        name: String,
        count: usize,
    },
}

// ── Content Tree ──────────────────────────────────────────────────────────────

/// A built, read-only content tree.
#[derive(Debug, Clone)]
pub struct ContentTree {
    root: TreeNode,
}

/// Result of [`ContentTree::lookup`]: the node plus, for chunks, the bytes
/// re-read from disk.
#[derive(Debug)]
pub struct Found<'a> {
    pub node: &'a TreeNode,
    pub raw: Bytes,
}

impl ContentTree {
    /// Build the tree for a file or directory.
    pub fn build(path: impl AsRef<Path>, max_depth: usize) -> Result<Self, TreeError> {
        let path = path.as_ref();
        let mut tasks = vec![Task::Visit {
            path: path.to_path_buf(),
            name: base_name(path),
            depth: 0,
        }];
        let mut done: Vec<TreeNode> = Vec::new();

        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit { path, name, depth } => {
                    if depth > max_depth {
                        return Err(TreeError::TooDeep {
                            path,
                            max: max_depth,
                        });
                    }
                    let meta = std::fs::metadata(&path).map_err(|source| TreeError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    if !meta.is_dir() {
                        done.push(build_file(&path, name)?);
                        continue;
                    }
                    let entries = list_dir(&path)?;
                    let count = entries.len();
                    tasks.push(Task::Seal { path, name, count });
                    for (child_name, child_path) in entries.into_iter().rev() {
                        tasks.push(Task::Visit {
                            path: child_path,
                            name: child_name,
                            depth: depth + 1,
                        });
                    }
                }
                Task::Seal { path, name, count } => {
                    let children = done.split_off(done.len() - count);
                    let hash = if children.is_empty() {
                        crypto::hash(path.to_string_lossy().as_bytes())
                    } else {
                        crypto::hash_concat(children.iter().map(|c| &c.hash))
                    };
                    done.push(TreeNode {
                        name,
                        hash,
                        kind: NodeKind::Directory { children },
                    });
                }
            }
        }

        let root = done.pop().ok_or_else(|| TreeError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "nothing was built"),
        })?;
        tracing::debug!(path = %path.display(), root = %hex::encode(root.hash), "content tree built");
        Ok(Self { root })
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    pub fn root_hash(&self) -> Hash {
        self.root.hash
    }

    /// Depth-first search for `target`. Chunk matches re-read their bytes.
    pub fn lookup(&self, target: &Hash) -> Result<Option<Found<'_>>, TreeError> {
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if node.hash == *target {
                let raw = match &node.kind {
                    NodeKind::Chunk {
                        source,
                        offset,
                        len,
                    } => read_chunk(source, *offset, *len)?,
                    _ => Bytes::new(),
                };
                return Ok(Some(Found { node, raw }));
            }
            stack.extend(node.children().iter().rev());
        }
        Ok(None)
    }

    /// The datum answering a GetDatum for `target`.
    ///
    /// A chunk whose bytes no longer hash to the stored value (the file
    /// changed after the tree was built) is reported as absent.
    pub fn datum(&self, target: &Hash) -> Result<Option<Datum>, TreeError> {
        let Some(Found { node, raw }) = self.lookup(target)? else {
            return Ok(None);
        };
        let datum = match &node.kind {
            NodeKind::Chunk { source, .. } => {
                if crypto::hash(&raw) != node.hash {
                    tracing::warn!(
                        path = %source.display(),
                        hash = %hex::encode(node.hash),
                        "source changed since tree build"
                    );
                    return Ok(None);
                }
                Datum::Chunk(raw)
            }
            NodeKind::BigFile { children } => {
                Datum::BigFile(children.iter().map(|c| c.hash).collect())
            }
            NodeKind::Directory { children } => Datum::Directory(
                children
                    .iter()
                    .map(|c| DirectoryEntry {
                        name: c.name.clone(),
                        hash: c.hash,
                    })
                    .collect(),
            ),
        };
        Ok(Some(datum))
    }
}

fn read_chunk(source: &Path, offset: u64, len: usize) -> Result<Bytes, TreeError> {
    let io_err = |source_err| TreeError::Io {
        path: source.to_path_buf(),
        source: source_err,
    };
    let mut file = File::open(source).map_err(io_err)?;
    file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
    let mut buf = vec![0u8; len.min(CHUNK_SIZE)];
    let n = read_full(&mut file, &mut buf).map_err(io_err)?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is nested deeper than {max} levels", path.display())]
    TooDeep { path: PathBuf, max: usize },
}
