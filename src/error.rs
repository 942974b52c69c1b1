//! Error types and handling for the SSTP client

use crate::session::ControlMessage;
use thiserror::Error;

/// Main error type for VPN operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network connectivity errors
    #[error("Network error: {0}")]
    Network(String),

    /// Connection errors
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// TUN interface errors
    #[error("TUN/TAP error: {0}")]
    TunTap(String),

    /// Routing errors
    #[error("Routing error: {0}")]
    Routing(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed wire units
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The protocol engine stopped with a fatal outcome
    #[error("Engine stopped: {0}")]
    Engine(ControlMessage),
}

/// Result type alias for VPN operations
pub type Result<T> = std::result::Result<T, VpnError>;

/// Failure to decode a wire unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("truncated {unit}: need {needed} bytes, have {available}")]
    Truncated {
        unit: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid {field} in {unit}: {value:#x}")]
    InvalidField {
        unit: &'static str,
        field: &'static str,
        value: u32,
    },

    #[error("length mismatch in {unit}: declared {declared}, actual {actual}")]
    LengthMismatch {
        unit: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("unknown {unit} type {value:#x}")]
    UnknownType { unit: &'static str, value: u32 },
}

impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<rustls::Error> for VpnError {
    fn from(err: rustls::Error) -> Self {
        VpnError::Tls(err.to_string())
    }
}
