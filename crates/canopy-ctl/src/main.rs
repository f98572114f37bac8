//! canopy-ctl — command-line client for the Canopy network.

use std::path::Path;

use anyhow::{Context, Result};

mod cmd;

use cmd::client::Options;

fn print_usage() {
    println!("Usage: canopy-ctl [options] <command>");
    println!();
    println!("Commands:");
    println!("  peers                                   List registered peers and their addresses");
    println!("  peer <name>                             Show a peer's addresses, key and root");
    println!("  hashes <peer>                           List every path and hash in a peer's tree");
    println!("  download-hash <peer> <hash> <out-dir>   Download the subtree rooted at <hash>");
    println!("  download-path <peer> <path> <out-dir>   Download one path of a peer's tree");
    println!();
    println!("Options:");
    println!("  --name <peer-name>     Name to register under");
    println!("  --server <name>        Rendezvous server peer name");
    println!("  --share <dir>          Directory to serve while connected");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut opts = Options::default();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--name" => {
                i += 1;
                opts.name = Some(args.get(i).context("--name requires a value")?.clone());
            }
            "--server" => {
                i += 1;
                opts.server = Some(args.get(i).context("--server requires a value")?.clone());
            }
            "--share" => {
                i += 1;
                opts.share = Some(args.get(i).context("--share requires a value")?.into());
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["peers"]                            => cmd::directory::cmd_peers(&opts).await,
        ["peer", name]                       => cmd::directory::cmd_peer(&opts, name).await,
        ["hashes", peer]                     => cmd::content::cmd_hashes(&opts, peer).await,
        ["download-hash", peer, hash, out]   => {
            cmd::content::cmd_download_hash(&opts, peer, hash, Path::new(out)).await
        }
        ["download-path", peer, path, out]   => {
            cmd::content::cmd_download_path(&opts, peer, path, Path::new(out)).await
        }
        ["help"] | ["--help"] | ["-h"] | []  => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
