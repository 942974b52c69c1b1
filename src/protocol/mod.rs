//! Wire formats: SSTP control/data packets and the PPP frames they carry
//!
//! Every type here implements [`WireUnit`]: lengths are always computed from
//! field values, never stored, and all integers are big-endian.

pub mod auth;
pub mod ipcp;
pub mod lcp;
pub mod options;
pub mod ppp;
pub mod sstp;
pub mod unit;

pub use options::{OptionPack, UnknownOption};
pub use ppp::{ConfigureCode, ConfigureFrame, LcpFrame};
pub use sstp::{Attribute, ControlPacket, CryptoBinding, DataPacket, HashProtocol, MessageType};
pub use unit::WireUnit;
