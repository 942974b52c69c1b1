//! VPN Client - connection lifecycle around the protocol engine
//!
//! [`VpnClient`] opens the TLS connection, hands it to [`session::run`] with a
//! `tun`-backed interface builder, and applies the reconnection policy from
//! the configuration when a connection ends with a fatal outcome.

use crate::config::Config;
use crate::crypto::tls::TlsConfig;
use crate::error::{Result, VpnError};
use crate::session::{self, ControlMessage, Outcome};
use crate::tunnel::TunBuilder;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Connection status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// TLS is up and the engine is running
    Connected,
    /// Waiting before the next attempt
    Reconnecting,
}

/// SSTP client with reconnection support
pub struct VpnClient {
    config: Arc<Config>,
    tls: TlsConfig,
    status: Mutex<ConnectionStatus>,
    last_outcome: Mutex<Option<ControlMessage>>,
}

impl VpnClient {
    /// Create a new VPN client with the given configuration
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the TLS setup fails
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let tls = TlsConfig::new(&config.server)?;
        Ok(Self {
            config: Arc::new(config),
            tls,
            status: Mutex::new(ConnectionStatus::Disconnected),
            last_outcome: Mutex::new(None),
        })
    }

    /// Get current connection status
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// The message that ended the most recent connection
    pub fn last_outcome(&self) -> Option<ControlMessage> {
        self.last_outcome.lock().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    /// One connection attempt, from TCP connect to the engine's final message
    pub async fn connect_once(&self, shutdown: &CancellationToken) -> Result<ControlMessage> {
        let server = &self.config.server;
        self.set_status(ConnectionStatus::Connecting);
        info!("Connecting to {}:{}", server.hostname, server.port);

        let connect = self.tls.connect(&server.hostname, server.port);
        let stream = tokio::select! {
            result = tokio::time::timeout(Duration::from_secs(server.timeout.into()), connect) => {
                result.map_err(|_| VpnError::Timeout(format!(
                    "TLS connection to {} not established", server.hostname
                )))??
            }
            _ = shutdown.cancelled() => {
                return Err(VpnError::Connection("Cancelled while connecting".to_string()));
            }
        };

        let gateway = stream.get_ref().0.peer_addr().ok().map(|addr| addr.ip());
        let builder = Arc::new(TunBuilder::new(gateway));
        self.set_status(ConnectionStatus::Connected);

        let message = session::run(self.config.clone(), stream, builder, shutdown.clone()).await;
        *self.last_outcome.lock() = Some(message.clone());
        Ok(message)
    }

    /// Connects and keeps reconnecting per the configured policy until
    /// `shutdown` is cancelled or the attempts run out
    ///
    /// # Errors
    /// Returns the last failure once no further attempt is allowed
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let policy = &self.config.reconnection;
        let attempts = if policy.enabled { policy.count + 1 } else { 1 };
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.set_status(ConnectionStatus::Reconnecting);
                info!("Reconnecting in {} s (attempt {attempt}/{attempts})", policy.interval);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(policy.interval.into())) => {}
                    _ = shutdown.cancelled() => break,
                }
            }

            let failure = match self.connect_once(&shutdown).await {
                Ok(message) if message.outcome == Outcome::DisconnectedLocally => {
                    info!("{message}");
                    last_error = None;
                    break;
                }
                Ok(message) => {
                    error!("Connection ended: {message}");
                    VpnError::Engine(message)
                }
                Err(e) => {
                    error!("Connection attempt failed: {e}");
                    e
                }
            };
            last_error = Some(failure);
            if shutdown.is_cancelled() {
                break;
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        match last_error {
            Some(e) if !shutdown.is_cancelled() => Err(e),
            Some(e) => {
                warn!("Stopped after: {e}");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
