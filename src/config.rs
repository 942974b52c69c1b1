//! Configuration module for the SSTP client
//!
//! This module provides TOML-based configuration parsing and validation.
//! Everything here is immutable once a session starts.

use crate::error::{Result, VpnError};
use crate::protocol::sstp::MAX_DATA_PAYLOAD;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Smallest MRU/MTU accepted on the link
pub const MIN_LINK_UNIT: u16 = 576;
/// IPv6 requires at least this MTU
pub const MIN_IPV6_MTU: u16 = 1280;
/// PAP carries each credential behind a one-byte length
pub const MAX_CREDENTIAL_LEN: usize = u8::MAX as usize;

/// Authentication protocols the client may accept during LCP negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthProtocol {
    /// Password Authentication Protocol
    #[serde(rename = "pap")]
    Pap,
    /// CHAP with the MS-CHAPv2 algorithm
    #[serde(rename = "mschapv2")]
    MsChapV2,
    /// MS-CHAPv2 carried inside EAP
    #[serde(rename = "eap-mschapv2")]
    EapMsChapV2,
}

/// Server configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname or IP address
    pub hostname: String,
    /// Server port (usually 443 for HTTPS)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Verify server certificate
    #[serde(default = "default_true")]
    pub verify_certificate: bool,
    /// PEM bundle trusted in addition to the bundled web roots
    #[serde(default)]
    pub ca_certificate_path: Option<String>,
    /// Allowed TLS versions ("1.2", "1.3")
    #[serde(default = "default_tls_versions")]
    pub tls_versions: Vec<String>,
    /// Allowed cipher suite names, empty means provider defaults
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    /// HTTPS upgrade timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u32,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    /// Enabled protocols, first entry is preferred
    #[serde(default = "default_protocols")]
    pub protocols: Vec<AuthProtocol>,
}

/// PPP link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PppConfig {
    /// MRU requested from the peer
    #[serde(default = "default_link_unit")]
    pub mru: u16,
    /// MTU of the virtual interface
    #[serde(default = "default_link_unit")]
    pub mtu: u16,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
    /// Ask the peer for a primary DNS server
    #[serde(default = "default_true")]
    pub request_dns: bool,
    /// Address proposed in IPCP instead of 0.0.0.0
    #[serde(default)]
    pub static_ipv4: Option<Ipv4Addr>,
    /// Restart timer for Configure/Connect requests in milliseconds
    #[serde(default = "default_restart_timer")]
    pub restart_timer_ms: u64,
    /// Maximum number of requests sent per negotiation
    #[serde(default = "default_max_configure")]
    pub max_configure: u32,
    /// SSTP echo keepalive interval in seconds (0 disables)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
}

impl Default for PppConfig {
    fn default() -> Self {
        Self {
            mru: default_link_unit(),
            mtu: default_link_unit(),
            ipv4: true,
            ipv6: false,
            request_dns: true,
            static_ipv4: None,
            restart_timer_ms: default_restart_timer(),
            max_configure: default_max_configure(),
            keepalive_interval: default_keepalive(),
        }
    }
}

/// Network configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Name of the TUN interface
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    /// Route all traffic through the tunnel
    #[serde(default)]
    pub default_route: bool,
    /// Custom routes (CIDR notation)
    #[serde(default)]
    pub custom_routes: Vec<String>,
    /// Capacity of one coalesced TLS write
    #[serde(default = "default_transport_buffer")]
    pub transport_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            default_route: false,
            custom_routes: vec![],
            transport_buffer_size: default_transport_buffer(),
        }
    }
}

/// Reconnection policy applied by the client above the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Number of reconnection attempts after the first failure
    #[serde(default = "default_reconnect_count")]
    pub count: u32,
    /// Delay between attempts in seconds
    #[serde(default = "default_reconnect_interval")]
    pub interval: u32,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: default_reconnect_count(),
            interval: default_reconnect_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// PPP link configuration
    #[serde(default)]
    pub ppp: PppConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Reconnection policy
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.hostname.is_empty() {
            return Err(VpnError::Config(
                "Server hostname cannot be empty".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(VpnError::Config("Server port cannot be zero".to_string()));
        }

        for version in &self.server.tls_versions {
            if version != "1.2" && version != "1.3" {
                return Err(VpnError::Config(format!(
                    "Unsupported TLS version '{version}'"
                )));
            }
        }

        if self.auth.username.is_empty() || self.auth.password.is_empty() {
            return Err(VpnError::Config(
                "Username and password are required".to_string(),
            ));
        }

        if self.auth.username.len() > MAX_CREDENTIAL_LEN
            || self.auth.password.len() > MAX_CREDENTIAL_LEN
        {
            return Err(VpnError::Config(format!(
                "Username and password must be at most {MAX_CREDENTIAL_LEN} bytes"
            )));
        }

        if self.auth.protocols.is_empty() {
            return Err(VpnError::Config(
                "At least one authentication protocol must be enabled".to_string(),
            ));
        }

        if !self.ppp.ipv4 && !self.ppp.ipv6 {
            return Err(VpnError::Config(
                "At least one of IPv4 and IPv6 must be enabled".to_string(),
            ));
        }

        let max = MAX_DATA_PAYLOAD as u16;
        for (name, value) in [("MRU", self.ppp.mru), ("MTU", self.ppp.mtu)] {
            if !(MIN_LINK_UNIT..=max).contains(&value) {
                return Err(VpnError::Config(format!(
                    "{name} must be between {MIN_LINK_UNIT} and {max}"
                )));
            }
        }

        if self.ppp.ipv6 && self.ppp.mtu < MIN_IPV6_MTU {
            return Err(VpnError::Config(format!(
                "MTU must be at least {MIN_IPV6_MTU} when IPv6 is enabled"
            )));
        }

        if self.ppp.max_configure == 0 || self.ppp.restart_timer_ms == 0 {
            return Err(VpnError::Config(
                "Restart timer and max_configure must be positive".to_string(),
            ));
        }

        if self.network.transport_buffer_size < self.ppp.mtu as usize + 8 {
            return Err(VpnError::Config(
                "Transport buffer must hold at least one full data packet".to_string(),
            ));
        }

        self.routes()?;

        Ok(())
    }

    /// Whether the client accepts `protocol` when the peer proposes it
    pub fn is_enabled(&self, protocol: AuthProtocol) -> bool {
        self.auth.protocols.contains(&protocol)
    }

    /// Parsed custom routes
    pub fn routes(&self) -> Result<Vec<IpNet>> {
        self.network
            .custom_routes
            .iter()
            .map(|route| {
                route
                    .parse::<IpNet>()
                    .map_err(|e| VpnError::Config(format!("Invalid route '{route}': {e}")))
            })
            .collect()
    }

    pub fn restart_timer(&self) -> Duration {
        Duration::from_millis(self.ppp.restart_timer_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.ppp.keepalive_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    /// Create a configuration with defaults for everything but the endpoint and credentials
    pub fn new(hostname: &str, username: &str, password: &str) -> Self {
        Self {
            server: ServerConfig {
                hostname: hostname.to_string(),
                port: default_port(),
                verify_certificate: true,
                ca_certificate_path: None,
                tls_versions: default_tls_versions(),
                cipher_suites: vec![],
                timeout: default_timeout(),
            },
            auth: AuthConfig {
                username: username.to_string(),
                password: password.to_string(),
                protocols: default_protocols(),
            },
            ppp: PppConfig::default(),
            network: NetworkConfig::default(),
            reconnection: ReconnectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl FromStr for Config {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VpnError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    443
}

fn default_timeout() -> u32 {
    10
}

fn default_tls_versions() -> Vec<String> {
    vec!["1.2".to_string(), "1.3".to_string()]
}

fn default_protocols() -> Vec<AuthProtocol> {
    vec![AuthProtocol::MsChapV2, AuthProtocol::Pap]
}

fn default_link_unit() -> u16 {
    1500
}

fn default_restart_timer() -> u64 {
    3000
}

fn default_max_configure() -> u32 {
    10
}

fn default_keepalive() -> u32 {
    30
}

fn default_interface_name() -> String {
    "sstp0".to_string()
}

fn default_transport_buffer() -> usize {
    16384
}

fn default_reconnect_count() -> u32 {
    3
}

fn default_reconnect_interval() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}
