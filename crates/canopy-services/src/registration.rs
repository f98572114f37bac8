//! Registration with the rendezvous server, and the keep-alive that holds it.
//!
//! We only send Hello. The server then drives the rest of the handshake by
//! sending PublicKey and Root requests, which the Responder answers and
//! records on the session. The registrar waits for the session to reach
//! `RootExchanged`, then marks it `Active`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use canopy_core::config::RegistrationConfig;
use canopy_core::wire::{Hello, MessageType};

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::session::RegistrationState;

#[derive(Debug, Clone)]
pub struct RegistrationPolicy {
    /// Pause between failed registration rounds.
    pub retry_delay: Duration,
    /// How long the server has to finish PublicKey/Root after our Hello.
    pub setup_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Keep-alive silence longer than this means the registration is lost.
    pub silence_window: Duration,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self::from(&RegistrationConfig::default())
    }
}

impl From<&RegistrationConfig> for RegistrationPolicy {
    fn from(config: &RegistrationConfig) -> Self {
        Self {
            retry_delay: config.retry_delay(),
            setup_timeout: config.setup_timeout(),
            keepalive_interval: config.keepalive_interval(),
            silence_window: config.silence_window(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("hello to server failed: {0}")]
    Handshake(#[from] ExchangeError),

    /// The server never completed PublicKey/Root.
    #[error("server did not finish setup, stopped at {reached}")]
    SetupTimeout { reached: RegistrationState },
}

impl RegistrationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistrationError::Handshake(e) => e.is_retryable(),
            RegistrationError::SetupTimeout { .. } => true,
        }
    }
}

pub struct Registrar {
    exchange: Arc<Exchange>,
    server: SocketAddr,
    policy: RegistrationPolicy,
}

impl Registrar {
    pub fn new(exchange: Arc<Exchange>, server: SocketAddr, policy: RegistrationPolicy) -> Self {
        exchange.session().set_server(server);
        Self {
            exchange,
            server,
            policy,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// One full registration round, from `Init` to `Active`.
    pub async fn register_once(&self) -> Result<(), RegistrationError> {
        let session = self.exchange.session();
        session.set_state(RegistrationState::Init);
        let mut state = session.subscribe();

        let hello = self.exchange.hello(self.server).await?;
        tracing::debug!(server = %self.server, name = %hello.name, "hello acknowledged");
        session.advance(&[RegistrationState::Init], RegistrationState::HelloSent);

        let established = tokio::time::timeout(
            self.policy.setup_timeout,
            state.wait_for(|s| s.is_established()),
        )
        .await;
        match established {
            Ok(Ok(_)) => {}
            _ => {
                return Err(RegistrationError::SetupTimeout {
                    reached: session.state(),
                })
            }
        }

        session.set_state(RegistrationState::Active);
        tracing::info!(
            server = %self.server,
            name = session.peer_name(),
            root = %hex::encode(session.local_root()),
            "registered"
        );
        Ok(())
    }

    /// Register, retrying with a fixed delay until it works.
    pub async fn register(&self) {
        let mut round: u32 = 0;
        loop {
            round += 1;
            match self.register_once().await {
                Ok(()) => return,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(server = %self.server, round, error = %e, "registration failed, retrying");
                }
                Err(e) => {
                    tracing::error!(server = %self.server, round, error = %e, "registration failed, retrying");
                }
            }
            tokio::time::sleep(self.policy.retry_delay).await;
        }
    }

    /// Keep the registration alive until shutdown.
    ///
    /// Sends Hello every `keepalive_interval`. When nothing has been answered
    /// for `silence_window` the session goes `Lost` and registration restarts.
    pub async fn keepalive(&self, mut shutdown: broadcast::Receiver<()>) {
        let session = self.exchange.session();
        let mut ticker = tokio::time::interval(self.policy.keepalive_interval);
        ticker.tick().await;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("keep-alive shutting down");
                    return;
                }

                _ = ticker.tick() => {
                    if session.state() != RegistrationState::Active {
                        continue;
                    }
                    match self.exchange.request_with(
                        self.server,
                        MessageType::Hello,
                        Hello::new(session.peer_name()).encode(),
                        MessageType::HelloReply,
                        1,
                    ).await {
                        Ok(_) => {
                            last_heard = Instant::now();
                            tracing::debug!(server = %self.server, "keep-alive answered");
                        }
                        Err(e) => {
                            tracing::warn!(
                                server = %self.server,
                                silent_for = ?last_heard.elapsed(),
                                error = %e,
                                "keep-alive missed"
                            );
                        }
                    }

                    if last_heard.elapsed() >= self.policy.silence_window {
                        session.set_state(RegistrationState::Lost);
                        tracing::info!(server = %self.server, "registration lost, re-registering");
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = self.register() => {}
                        }
                        last_heard = Instant::now();
                        ticker.reset();
                    }
                }
            }
        }
    }
}
