//! Bringing up a short-lived peer: config, directory, node, registration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use canopy_core::config::CanopyConfig;
use canopy_core::ContentTree;
use canopy_services::{
    bind_addr_for, ExchangePolicy, HttpDirectory, NatPolicy, Node, RegistrationPolicy, Session,
    Traversal,
};

/// Command-line overrides applied on top of the loaded config.
#[derive(Debug, Default)]
pub struct Options {
    pub name: Option<String>,
    pub server: Option<String>,
    pub share: Option<PathBuf>,
}

pub fn load_config(opts: &Options) -> CanopyConfig {
    let mut config = CanopyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CanopyConfig::default()
    });
    if let Some(name) = &opts.name {
        config.identity.peer_name = name.clone();
    }
    if let Some(server) = &opts.server {
        config.directory.server_name = server.clone();
    }
    if let Some(share) = &opts.share {
        config.share.path = share.clone();
    }
    config
}

pub fn directory(config: &CanopyConfig) -> Result<HttpDirectory> {
    HttpDirectory::from_config(&config.directory).context("bad directory config")
}

/// A registered node plus what it needs to reach other peers.
pub struct Client {
    pub config: CanopyConfig,
    pub directory: HttpDirectory,
    pub server: SocketAddr,
    pub node: Node,
    _shutdown: broadcast::Sender<()>,
}

impl Client {
    /// Build the share (if any), bind, and register with the server.
    pub async fn connect(opts: &Options) -> Result<Self> {
        let config = load_config(opts);
        let directory = directory(&config)?;

        let server_name = &config.directory.server_name;
        let server = directory
            .resolve(server_name)
            .await
            .with_context(|| format!("failed to look up server {server_name}"))?
            .into_iter()
            .next()
            .with_context(|| format!("server {server_name} advertises no address"))?;

        let tree = if config.share.path.as_os_str().is_empty() {
            None
        } else {
            let path = config.share.path.clone();
            let max_depth = config.share.max_depth;
            let tree = tokio::task::spawn_blocking(move || ContentTree::build(&path, max_depth))
                .await
                .context("tree build panicked")?
                .with_context(|| format!("failed to build tree for {}", config.share.path.display()))?;
            Some(Arc::new(tree))
        };

        let (shutdown, _) = broadcast::channel(1);
        let session = Session::new(
            config.identity.peer_name.clone(),
            tree.as_ref().map(|t| t.root_hash()),
        );
        let node = Node::bind(
            bind_addr_for(&config.network.bind_addr, server)?,
            session,
            tree,
            ExchangePolicy::from(&config.exchange),
            &shutdown,
        )
        .await?;

        eprintln!("Registering with {server_name} ({server})...");
        node.registrar(server, RegistrationPolicy::from(&config.registration))
            .register()
            .await;

        Ok(Self {
            config,
            directory,
            server,
            node,
            _shutdown: shutdown,
        })
    }

    /// Open a path to `peer` and return its address.
    pub async fn reach(&self, peer: &str) -> Result<SocketAddr> {
        let known = self
            .directory
            .resolve(peer)
            .await
            .with_context(|| format!("failed to look up peer {peer}"))?
            .into_iter()
            .next();
        let traversal = self.node.traversal(
            self.directory.clone(),
            self.server,
            NatPolicy::from(&self.config.nat),
        );
        match traversal.traverse(peer, known).await {
            Traversal::Direct(addr) => {
                eprintln!("Reached {peer} directly at {addr}.");
                Ok(addr)
            }
            Traversal::Relayed(addr) => {
                eprintln!("Reached {peer} at {addr} through the server.");
                Ok(addr)
            }
            Traversal::Failed => anyhow::bail!("could not reach peer {peer}"),
        }
    }
}
