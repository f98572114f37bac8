//! Commands that walk a remote peer's content tree.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};

use canopy_core::crypto::parse_hash;
use canopy_core::Hash;
use canopy_services::download::RemotePeer;
use canopy_services::{DownloadEngine, DownloadReport, DownloadRequest};

use super::client::{Client, Options};

pub async fn cmd_hashes(opts: &Options, peer: &str) -> Result<()> {
    let client = Client::connect(opts).await?;
    let addr = client.reach(peer).await?;
    let root = peer_root(&client, peer, addr).await?;

    let report = engine(&client, addr)
        .run(&DownloadRequest::print(root).with_root_name(peer))
        .await?;

    println!("═══════════════════════════════════════");
    println!("  {peer}  {}", hex::encode(root));
    println!("═══════════════════════════════════════");
    for line in listing_lines(&root, &report) {
        println!("  {line}");
    }
    print_problems(&report);

    Ok(())
}

pub async fn cmd_download_hash(opts: &Options, peer: &str, hash: &str, out: &Path) -> Result<()> {
    let hash = parse_hash(hash).with_context(|| format!("not a 64-digit hex hash: {hash}"))?;
    let client = Client::connect(opts).await?;
    let addr = client.reach(peer).await?;

    let report = engine(&client, addr)
        .run(&DownloadRequest::by_hash(hash, out))
        .await?;
    print_summary(&report, out);

    Ok(())
}

pub async fn cmd_download_path(opts: &Options, peer: &str, path: &str, out: &Path) -> Result<()> {
    let client = Client::connect(opts).await?;
    let addr = client.reach(peer).await?;
    let root = peer_root(&client, peer, addr).await?;

    let report = engine(&client, addr)
        .run(&DownloadRequest::by_path(root, path, out).with_root_name(peer))
        .await?;
    if report.files_written == 0 && report.directories_created == 0 && report.failures.is_empty() {
        println!("Nothing at {path} on {peer}.");
    }
    print_summary(&report, out);

    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn engine(client: &Client, addr: SocketAddr) -> DownloadEngine<RemotePeer> {
    DownloadEngine::new(client.node.remote(addr), client.config.download.max_depth)
}

/// The peer's root, asked of the peer itself and else of the directory.
async fn peer_root(client: &Client, peer: &str, addr: SocketAddr) -> Result<Hash> {
    match client.node.exchange().root(addr).await {
        Ok(root) => Ok(root),
        Err(e) => {
            tracing::warn!(peer, error = %e, "root request failed, asking the directory");
            client
                .directory
                .root(peer)
                .await?
                .with_context(|| format!("{peer} has not announced a root"))
        }
    }
}

/// `path <=> hash` lines, the root itself first as `/`.
fn listing_lines(root: &Hash, report: &DownloadReport) -> Vec<String> {
    std::iter::once(format!("/ <=> {}", hex::encode(root)))
        .chain(
            report
                .listing
                .iter()
                .map(|(path, hash)| format!("{path} <=> {}", hex::encode(hash))),
        )
        .collect()
}

fn print_summary(report: &DownloadReport, out: &Path) {
    println!("═══════════════════════════════════════");
    println!("  Download into {}", out.display());
    println!("═══════════════════════════════════════");
    println!("  Files       : {}", report.files_written);
    println!("  Directories : {}", report.directories_created);
    println!("  Bytes       : {}", report.bytes_written);
    print_problems(report);
}

fn print_problems(report: &DownloadReport) {
    if report.absent > 0 {
        println!("  Missing     : {} datum(s) the peer no longer has", report.absent);
    }
    if !report.failures.is_empty() {
        println!("\n  Failed entries:");
        for f in &report.failures {
            println!("  ┌─ {}", f.remote_path);
            println!("  └─ {}", f.error);
        }
    }
}
