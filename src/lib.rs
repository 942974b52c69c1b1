//! rsstp - SSTP VPN client protocol engine
//!
//! Tunnels PPP over an HTTPS connection to an SSTP gateway and forwards IP
//! packets between a local TUN interface and the tunnel.
//!
//! ## Layers
//! - [`protocol`]: wire codecs for SSTP control and data packets and PPP frames
//! - [`crypto`]: MS-CHAPv2, the SSTP crypto binding and the rustls terminal
//! - [`negotiation`]: the SSTP handshake, LCP/IPCP/IPv6CP and authentication
//! - [`session`]: the concurrent engine tying the TLS stream, the state
//!   machines and the IP terminal together
//! - [`tunnel`]: the IP terminal contract and the `tun`-backed implementation
//! - [`client`]: connection lifecycle and reconnection policy
//!
//! ```no_run
//! use rsstp::{Config, VpnClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> rsstp::Result<()> {
//! let config = Config::from_file("/etc/rsstp/client.toml")?;
//! let client = VpnClient::new(config)?;
//! client.run(CancellationToken::new()).await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod tunnel;

pub use client::{ConnectionStatus, VpnClient};
pub use config::{AuthProtocol, Config};
pub use error::{ParseError, Result, VpnError};
pub use session::{ControlMessage, Origin, Outcome};
pub use tunnel::{InterfaceBuilder, InterfaceParams, IpTerminal};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
