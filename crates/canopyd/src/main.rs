//! canopyd — Canopy peer daemon.
//!
//! Shares a directory, registers with the rendezvous server, keeps the
//! registration alive and answers peers until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use canopy_core::config::CanopyConfig;
use canopy_core::ContentTree;
use canopy_services::{
    bind_addr_for, peer, ExchangePolicy, HttpDirectory, Node, RegistrationPolicy, Session,
};

/// Peers silent for this long are dropped from the table.
const PEER_TTL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CanopyConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = CanopyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CanopyConfig::default()
    });
    if let Some(path) = std::env::args().nth(1) {
        config.share.path = path.into();
    }
    tracing::info!(name = %config.identity.peer_name, share = %config.share.path.display(), "canopyd starting");

    // Content tree
    let tree = if config.share.path.as_os_str().is_empty() {
        tracing::info!("nothing shared, announcing the empty root");
        None
    } else {
        let path = config.share.path.clone();
        let max_depth = config.share.max_depth;
        let tree = tokio::task::spawn_blocking(move || ContentTree::build(&path, max_depth))
            .await
            .context("tree build panicked")?
            .with_context(|| format!("failed to build tree for {}", config.share.path.display()))?;
        tracing::info!(root = %hex::encode(tree.root_hash()), "content tree built");
        Some(Arc::new(tree))
    };

    // Rendezvous server
    let directory = HttpDirectory::from_config(&config.directory).context("bad directory config")?;
    let server = directory
        .resolve(&config.directory.server_name)
        .await
        .with_context(|| format!("failed to look up server {}", config.directory.server_name))?
        .into_iter()
        .next()
        .with_context(|| format!("server {} advertises no address", config.directory.server_name))?;
    tracing::info!(%server, "rendezvous server resolved");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Node ─────────────────────────────────────────────────────────────────
    let session = Session::new(
        config.identity.peer_name.clone(),
        tree.as_ref().map(|t| t.root_hash()),
    );
    let node = Node::bind(
        bind_addr_for(&config.network.bind_addr, server)?,
        session,
        tree,
        ExchangePolicy::from(&config.exchange),
        &shutdown_tx,
    )
    .await?;

    let registrar = Arc::new(node.registrar(server, RegistrationPolicy::from(&config.registration)));

    let registration_task = {
        let registrar = registrar.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            registrar.register().await;
            registrar.keepalive(shutdown).await;
        })
    };

    let peer_printer = {
        let peers = node.peers().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let expired = peer::expire(&peers, PEER_TTL);
                tracing::info!(count = peers.len(), expired, "peer table snapshot");
                for p in peers.iter() {
                    tracing::info!(
                        name = %p.name,
                        addr = %p.addr,
                        seen_secs_ago = p.last_seen.elapsed().as_secs(),
                        "  peer"
                    );
                }
            }
        })
    };

    let session = node.session().clone();
    let node_task = tokio::spawn(node.join());

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!(state = %session.state(), "shutting down"),
        r = registration_task    => tracing::error!("registration task exited: {:?}", r),
        r = peer_printer         => tracing::error!("peer printer exited: {:?}", r),
        r = node_task            => tracing::error!("node exited: {:?}", r),
    }

    Ok(())
}
