//! Directory queries: who is registered, and what the server knows of them.

use anyhow::Result;

use canopy_core::crypto::PublicKey;

use super::client::{self, Options};

pub async fn cmd_peers(opts: &Options) -> Result<()> {
    let config = client::load_config(opts);
    let dir = client::directory(&config)?;
    let names = dir.peers().await?;

    if names.is_empty() {
        println!("No peers registered.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Registered Peers ({})", names.len());
    println!("═══════════════════════════════════════");

    for name in &names {
        match dir.addresses(name).await {
            Ok(addrs) if addrs.is_empty() => println!("  {name}  (no address)"),
            Ok(addrs) => println!("  {name}  {}", addrs.join(", ")),
            Err(e) => println!("  {name}  (lookup failed: {e})"),
        }
    }

    Ok(())
}

pub async fn cmd_peer(opts: &Options, name: &str) -> Result<()> {
    let config = client::load_config(opts);
    let dir = client::directory(&config)?;

    let addrs = dir.addresses(name).await?;
    let key = dir.key(name).await?;
    let root = dir.root(name).await?;

    println!("═══════════════════════════════════════");
    println!("  Peer {name}");
    println!("═══════════════════════════════════════");
    if addrs.is_empty() {
        println!("  addresses : none");
    } else {
        println!("  addresses :");
        for a in &addrs {
            println!("    {a}");
        }
    }
    println!("  key       : {}", key.as_ref().map(PublicKey::to_hex).unwrap_or_else(|| "none".into()));
    println!("  root      : {}", root.map(hex::encode).unwrap_or_else(|| "none".into()));

    Ok(())
}
