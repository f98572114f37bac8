//! HTTP rendezvous directory client.
//!
//! ```text
//!   GET /peers/                 newline-separated peer names
//!   GET /peers/{name}/addresses newline-separated host:port, 404 unknown
//!   GET /peers/{name}/key       64 bytes, 204 none, 404 unknown
//!   GET /peers/{name}/root      32 bytes, 204 none, 404 unknown
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{StatusCode, Url};

use canopy_core::config::DirectoryConfig;
use canopy_core::crypto::{PublicKey, HASH_LEN};
use canopy_core::Hash;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory does not know peer {0:?}")]
    UnknownPeer(String),

    #[error("{url} answered {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("{url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("invalid directory url {0:?}")]
    InvalidUrl(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

/// Where NAT traversal looks up a peer's advertised addresses.
pub trait PeerDirectory: Send + Sync {
    fn addresses(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DirectoryError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    base: Url,
}

impl HttpDirectory {
    pub fn new(base: &str, accept_invalid_certs: bool, timeout: Duration) -> Result<Self, DirectoryError> {
        let base = Url::parse(base).map_err(|_| DirectoryError::InvalidUrl(base.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(DirectoryError::InvalidUrl(base.to_string()));
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base })
    }

    pub fn from_config(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        Self::new(
            &config.url,
            config.accept_invalid_certs,
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    /// Names of every registered peer.
    pub async fn peers(&self) -> Result<Vec<String>, DirectoryError> {
        let url = self.url(&["peers", ""])?;
        match self.get(&url).await? {
            (StatusCode::OK, body) => Ok(parse_lines(&body)),
            (status, _) => Err(unexpected(&url, status)),
        }
    }

    pub async fn addresses(&self, name: &str) -> Result<Vec<String>, DirectoryError> {
        let url = self.url(&["peers", name, "addresses"])?;
        match self.get(&url).await? {
            (StatusCode::OK, body) => Ok(parse_lines(&body)),
            (StatusCode::NOT_FOUND, _) => Err(DirectoryError::UnknownPeer(name.to_string())),
            (status, _) => Err(unexpected(&url, status)),
        }
    }

    pub async fn key(&self, name: &str) -> Result<Option<PublicKey>, DirectoryError> {
        let url = self.url(&["peers", name, "key"])?;
        let Some(body) = self.optional(&url, name).await? else {
            return Ok(None);
        };
        PublicKey::from_slice(&body).map(Some).ok_or_else(|| DirectoryError::Malformed {
            url: url.to_string(),
            reason: format!("key of {} bytes", body.len()),
        })
    }

    pub async fn root(&self, name: &str) -> Result<Option<Hash>, DirectoryError> {
        let url = self.url(&["peers", name, "root"])?;
        let Some(body) = self.optional(&url, name).await? else {
            return Ok(None);
        };
        let root = Hash::try_from(&body[..]).map_err(|_| DirectoryError::Malformed {
            url: url.to_string(),
            reason: format!("root of {} bytes, expected {HASH_LEN}", body.len()),
        })?;
        Ok(Some(root))
    }

    /// The peer's advertised endpoints, resolved to socket addresses.
    /// Entries that do not resolve are skipped.
    pub async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>, DirectoryError> {
        let mut out = Vec::new();
        for endpoint in self.addresses(name).await? {
            match tokio::net::lookup_host(endpoint.as_str()).await {
                Ok(addrs) => out.extend(addrs),
                Err(e) => tracing::warn!(peer = name, endpoint = %endpoint, error = %e, "unresolvable endpoint"),
            }
        }
        Ok(out)
    }

    /// 200 → body, 204 → None, 404 → unknown peer.
    async fn optional(&self, url: &Url, name: &str) -> Result<Option<Bytes>, DirectoryError> {
        match self.get(url).await? {
            (StatusCode::OK, body) => Ok(Some(body)),
            (StatusCode::NO_CONTENT, _) => Ok(None),
            (StatusCode::NOT_FOUND, _) => Err(DirectoryError::UnknownPeer(name.to_string())),
            (status, _) => Err(unexpected(url, status)),
        }
    }

    async fn get(&self, url: &Url) -> Result<(StatusCode, Bytes), DirectoryError> {
        tracing::debug!(%url, "directory request");
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        Ok((status, body))
    }

    fn url(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl PeerDirectory for HttpDirectory {
    async fn addresses(&self, name: &str) -> Result<Vec<String>, DirectoryError> {
        HttpDirectory::addresses(self, name).await
    }
}

fn unexpected(url: &Url, status: StatusCode) -> DirectoryError {
    DirectoryError::UnexpectedStatus {
        url: url.to_string(),
        status: status.as_u16(),
    }
}

/// Non-empty trimmed lines of a text body.
pub fn parse_lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Endpoints that are literal `ip:port` addresses, in order.
pub fn parse_endpoints(endpoints: &[String]) -> Vec<SocketAddr> {
    endpoints.iter().filter_map(|e| e.parse().ok()).collect()
}
