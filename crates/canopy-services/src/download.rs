//! Download engine — walks a remote tree and rebuilds it on disk.
//!
//! The walk is an explicit stack of steps, not recursion, so a deep or
//! hostile tree costs heap rather than call stack and hits `max_depth`
//! instead of overflowing. Every directory entry gets its own branch: its
//! local path, remote path, mode and (for files) the open handle. Big-file
//! children share their parent's branch, which is how chunks are appended in
//! order. Steps are popped depth-first, left to right.
//!
//! A timeout or integrity fault inside an entry abandons that entry and is
//! recorded in the report. Filesystem errors abort the walk.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use canopy_core::wire::{Datum, DirectoryEntry};
use canopy_core::Hash;

use crate::error::ExchangeError;
use crate::exchange::{DatumOutcome, Exchange};

/// What the walk does with what it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// List `path <=> hash` for every directory entry. Writes nothing.
    PrintHash,
    /// Materialize the whole subtree.
    DownloadByHash,
    /// Descend only toward `search_path`, then materialize what it names.
    DownloadByPath,
}

impl Mode {
    fn materializes(self) -> bool {
        self == Mode::DownloadByHash
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub root: Hash,
    pub mode: Mode,
    pub output_dir: PathBuf,
    /// Slash-separated path below the root, for `DownloadByPath`.
    pub search_path: String,
    /// Local and displayed name of the root itself.
    pub root_name: String,
}

impl DownloadRequest {
    pub fn print(root: Hash) -> Self {
        Self {
            root,
            mode: Mode::PrintHash,
            output_dir: PathBuf::new(),
            search_path: String::new(),
            root_name: hex::encode(root),
        }
    }

    pub fn by_hash(root: Hash, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: Mode::DownloadByHash,
            output_dir: output_dir.into(),
            ..Self::print(root)
        }
    }

    pub fn by_path(root: Hash, search_path: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: Mode::DownloadByPath,
            output_dir: output_dir.into(),
            search_path: search_path.trim_matches('/').to_string(),
            ..Self::print(root)
        }
    }

    pub fn with_root_name(mut self, name: impl Into<String>) -> Self {
        self.root_name = name.into();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is nested deeper than {max}")]
    TooDeep { path: String, max: usize },

    #[error("malformed tree: {0}")]
    Malformed(String),
}

/// One entry abandoned during the walk.
#[derive(Debug)]
pub struct BranchFailure {
    pub remote_path: String,
    pub error: DownloadError,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    /// `(path, hash)` per directory entry, in PrintHash mode.
    pub listing: Vec<(String, Hash)>,
    pub files_written: usize,
    pub directories_created: usize,
    pub bytes_written: u64,
    /// Datums the peer answered NoDatum for.
    pub absent: usize,
    pub failures: Vec<BranchFailure>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.absent == 0
    }
}

/// Something datums can be fetched from.
pub trait DatumSource: Send + Sync {
    fn fetch(&self, hash: &Hash) -> impl Future<Output = Result<DatumOutcome, ExchangeError>> + Send;
}

/// A peer reached through an [`Exchange`].
pub struct RemotePeer {
    exchange: Arc<Exchange>,
    addr: SocketAddr,
}

impl RemotePeer {
    pub fn new(exchange: Arc<Exchange>, addr: SocketAddr) -> Self {
        Self { exchange, addr }
    }
}

impl DatumSource for RemotePeer {
    async fn fetch(&self, hash: &Hash) -> Result<DatumOutcome, ExchangeError> {
        self.exchange.get_datum(self.addr, hash).await
    }
}

// ── Walk state ───────────────────────────────────────────────────────────────

struct Branch {
    parent: Option<usize>,
    mode: Mode,
    local: PathBuf,
    /// Path below the root; empty for the root itself.
    remote: String,
    file: Option<BufWriter<File>>,
    abandoned: bool,
}

enum Step {
    Fetch { hash: Hash, branch: usize, depth: usize },
    Close { branch: usize },
}

pub struct DownloadEngine<S> {
    source: S,
    max_depth: usize,
}

impl<S: DatumSource> DownloadEngine<S> {
    pub fn new(source: S, max_depth: usize) -> Self {
        Self { source, max_depth }
    }

    pub async fn run(&self, request: &DownloadRequest) -> Result<DownloadReport, DownloadError> {
        let mut report = DownloadReport::default();

        let root_mode = match request.mode {
            Mode::DownloadByPath if request.search_path.is_empty() => Mode::DownloadByHash,
            m => m,
        };
        if request.mode != Mode::PrintHash {
            std::fs::create_dir_all(&request.output_dir).map_err(|source| DownloadError::Io {
                path: request.output_dir.clone(),
                source,
            })?;
        }

        let mut branches = vec![Branch {
            parent: None,
            mode: root_mode,
            local: request.output_dir.join(&request.root_name),
            remote: String::new(),
            file: None,
            abandoned: false,
        }];
        let mut stack = vec![
            Step::Close { branch: 0 },
            Step::Fetch {
                hash: request.root,
                branch: 0,
                depth: 0,
            },
        ];

        while let Some(step) = stack.pop() {
            let (hash, branch, depth) = match step {
                Step::Close { branch } => {
                    close(&mut branches[branch])?;
                    continue;
                }
                Step::Fetch { hash, branch, depth } => (hash, branch, depth),
            };
            if is_abandoned(&branches, branch) {
                continue;
            }
            if depth > self.max_depth {
                return Err(DownloadError::TooDeep {
                    path: display_path(&request.root_name, &branches[branch].remote),
                    max: self.max_depth,
                });
            }

            if branch != 0 && branches[branch].mode == Mode::PrintHash {
                let path = display_path(&request.root_name, &branches[branch].remote);
                report.listing.push((path, hash));
            }

            let datum = match self.source.fetch(&hash).await {
                Ok(DatumOutcome::Found(datum)) => datum,
                Ok(DatumOutcome::Absent) => {
                    tracing::debug!(hash = %hex::encode(hash), "peer has no such datum");
                    report.absent += 1;
                    continue;
                }
                Err(e) if branch == 0 => return Err(e.into()),
                Err(e) => {
                    let b = &mut branches[branch];
                    let remote_path = display_path(&request.root_name, &b.remote);
                    tracing::warn!(path = %remote_path, hash = %hex::encode(hash), error = %e, "abandoning branch");
                    b.abandoned = true;
                    if b.file.take().is_some() {
                        if let Err(e) = std::fs::remove_file(&b.local) {
                            tracing::warn!(path = %b.local.display(), error = %e, "failed to remove partial file");
                        }
                    }
                    report.failures.push(BranchFailure {
                        remote_path,
                        error: e.into(),
                    });
                    continue;
                }
            };

            match datum {
                Datum::Chunk(bytes) => {
                    let Branch { mode, local, file, .. } = &mut branches[branch];
                    if !mode.materializes() {
                        continue;
                    }
                    if file.is_none() {
                        let f = OpenOptions::new()
                            .write(true)
                            .create(true)
                            .truncate(true)
                            .open(&*local)
                            .map_err(|source| io_error(local, source))?;
                        *file = Some(BufWriter::new(f));
                        report.files_written += 1;
                    }
                    if let Some(writer) = file.as_mut() {
                        writer.write_all(&bytes).map_err(|source| io_error(local, source))?;
                    }
                    report.bytes_written += bytes.len() as u64;
                }

                Datum::BigFile(children) => {
                    if branches[branch].mode != Mode::DownloadByHash {
                        continue;
                    }
                    for child in children.into_iter().rev() {
                        stack.push(Step::Fetch {
                            hash: child,
                            branch,
                            depth: depth + 1,
                        });
                    }
                }

                Datum::Directory(entries) => {
                    let mode = branches[branch].mode;
                    if mode == Mode::DownloadByHash {
                        let local = &branches[branch].local;
                        if !local.is_dir() {
                            std::fs::create_dir_all(local).map_err(|source| io_error(local, source))?;
                            report.directories_created += 1;
                        }
                    }

                    let mut children = Vec::with_capacity(entries.len());
                    let mut seen = HashSet::with_capacity(entries.len());
                    for entry in entries {
                        let parent = &branches[branch];
                        let remote = join_remote(&parent.remote, &entry.name);
                        let problem = if !entry.is_safe_name() {
                            Some("unsafe")
                        } else if !seen.insert(entry.name.clone()) {
                            Some("duplicate")
                        } else {
                            None
                        };
                        if let Some(problem) = problem {
                            report.failures.push(BranchFailure {
                                remote_path: display_path(&request.root_name, &remote),
                                error: DownloadError::Malformed(format!("{problem} entry name {:?}", entry.name)),
                            });
                            continue;
                        }
                        let Some((child_mode, local)) =
                            route_entry(mode, &entry, &remote, parent, request)
                        else {
                            continue;
                        };
                        children.push((entry.hash, Branch {
                            parent: Some(branch),
                            mode: child_mode,
                            local,
                            remote,
                            file: None,
                            abandoned: false,
                        }));
                    }

                    for (hash, child) in children.into_iter().rev() {
                        let id = branches.len();
                        branches.push(child);
                        stack.push(Step::Close { branch: id });
                        stack.push(Step::Fetch {
                            hash,
                            branch: id,
                            depth: depth + 1,
                        });
                    }
                }
            }
        }

        tracing::info!(
            root = %hex::encode(request.root),
            mode = ?request.mode,
            files = report.files_written,
            dirs = report.directories_created,
            bytes = report.bytes_written,
            absent = report.absent,
            failures = report.failures.len(),
            "download complete"
        );
        Ok(report)
    }
}

/// Mode and local path for a directory entry, or None to prune it.
fn route_entry(
    mode: Mode,
    entry: &DirectoryEntry,
    remote: &str,
    parent: &Branch,
    request: &DownloadRequest,
) -> Option<(Mode, PathBuf)> {
    match mode {
        Mode::PrintHash => Some((Mode::PrintHash, PathBuf::new())),
        Mode::DownloadByHash => Some((Mode::DownloadByHash, parent.local.join(&entry.name))),
        Mode::DownloadByPath => {
            if remote == request.search_path {
                Some((Mode::DownloadByHash, request.output_dir.join(&entry.name)))
            } else if request
                .search_path
                .strip_prefix(remote)
                .is_some_and(|rest| rest.starts_with('/'))
            {
                Some((Mode::DownloadByPath, PathBuf::new()))
            } else {
                None
            }
        }
    }
}

fn is_abandoned(branches: &[Branch], mut id: usize) -> bool {
    loop {
        let b = &branches[id];
        if b.abandoned {
            return true;
        }
        match b.parent {
            Some(p) => id = p,
            None => return false,
        }
    }
}

fn close(branch: &mut Branch) -> Result<(), DownloadError> {
    if let Some(mut file) = branch.file.take() {
        file.flush().map_err(|source| io_error(&branch.local, source))?;
    }
    Ok(())
}

fn join_remote(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn display_path(root_name: &str, remote: &str) -> String {
    if remote.is_empty() {
        root_name.to_string()
    } else {
        format!("{root_name}/{remote}")
    }
}

fn io_error(path: &Path, source: std::io::Error) -> DownloadError {
    DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}
