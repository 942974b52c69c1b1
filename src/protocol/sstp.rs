//! SSTP control packets, attributes and the data packet prefix

use super::unit::{ensure, finished, WireUnit};
use crate::error::ParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const SSTP_VERSION: u8 = 0x10;
pub const CONTROL_FLAG: u8 = 0x01;
pub const DATA_FLAG: u8 = 0x00;

/// Length fields are 12 bits wide
pub const LENGTH_MASK: u16 = 0x0FFF;
pub const MAX_PACKET_LENGTH: usize = LENGTH_MASK as usize;

pub const CONTROL_HEADER_LEN: usize = 8;
pub const ATTRIBUTE_HEADER_LEN: usize = 4;
/// SSTP data header (4) + HDLC address/control (2) + PPP protocol (2)
pub const DATA_PREFIX_LEN: usize = 8;
pub const MAX_DATA_PAYLOAD: usize = MAX_PACKET_LENGTH - DATA_PREFIX_LEN;

pub const HDLC_ADDRESS: u8 = 0xFF;
pub const HDLC_CONTROL: u8 = 0x03;

pub const ENCAPSULATED_PROTOCOL_PPP: u16 = 0x0001;
pub const MAX_STATUS_VALUE: usize = 64;
pub const NONCE_LEN: usize = 32;

const CRYPTO_BINDING_LEN: usize = 104;
const CRYPTO_BINDING_REQUEST_LEN: usize = 40;

const PACKET_UNIT: &str = "SSTP control packet";
const ATTRIBUTE_UNIT: &str = "SSTP attribute";
const DATA_UNIT: &str = "SSTP data packet";

/// Hash protocol used for the certificate hash and the compound MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashProtocol {
    Sha1 = 0x01,
    Sha256 = 0x02,
}

impl HashProtocol {
    /// Picks SHA-256 when the server offers it
    pub fn from_bitmask(mask: u8) -> Option<Self> {
        if mask & HashProtocol::Sha256 as u8 != 0 {
            Some(HashProtocol::Sha256)
        } else if mask & HashProtocol::Sha1 as u8 != 0 {
            Some(HashProtocol::Sha1)
        } else {
            None
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashProtocol::Sha1 => 20,
            HashProtocol::Sha256 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    CallConnectRequest = 0x0001,
    CallConnectAck = 0x0002,
    CallConnectNak = 0x0003,
    CallConnected = 0x0004,
    CallAbort = 0x0005,
    CallDisconnect = 0x0006,
    CallDisconnectAck = 0x0007,
    EchoRequest = 0x0008,
    EchoResponse = 0x0009,
}

impl TryFrom<u16> for MessageType {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, ParseError> {
        Ok(match value {
            0x0001 => MessageType::CallConnectRequest,
            0x0002 => MessageType::CallConnectAck,
            0x0003 => MessageType::CallConnectNak,
            0x0004 => MessageType::CallConnected,
            0x0005 => MessageType::CallAbort,
            0x0006 => MessageType::CallDisconnect,
            0x0007 => MessageType::CallDisconnectAck,
            0x0008 => MessageType::EchoRequest,
            0x0009 => MessageType::EchoResponse,
            other => {
                return Err(ParseError::UnknownType {
                    unit: PACKET_UNIT,
                    value: other as u32,
                })
            }
        })
    }
}

/// Payload of the Crypto-Binding attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoBinding {
    pub hash_protocol: u8,
    pub nonce: [u8; NONCE_LEN],
    pub cert_hash: [u8; 32],
    pub compound_mac: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    EncapsulatedProtocol(u16),
    StatusInfo {
        attribute_id: u8,
        status: u32,
        value: Bytes,
    },
    CryptoBinding(CryptoBinding),
    CryptoBindingRequest {
        hash_bitmask: u8,
        nonce: [u8; NONCE_LEN],
    },
    Unknown {
        id: u8,
        value: Bytes,
    },
}

impl Attribute {
    pub fn id(&self) -> u8 {
        match self {
            Attribute::EncapsulatedProtocol(_) => 1,
            Attribute::StatusInfo { .. } => 2,
            Attribute::CryptoBinding(_) => 3,
            Attribute::CryptoBindingRequest { .. } => 4,
            Attribute::Unknown { id, .. } => *id,
        }
    }
}

impl WireUnit for Attribute {
    fn length(&self) -> usize {
        ATTRIBUTE_HEADER_LEN
            + match self {
                Attribute::EncapsulatedProtocol(_) => 2,
                Attribute::StatusInfo { value, .. } => 8 + value.len(),
                Attribute::CryptoBinding(_) => CRYPTO_BINDING_LEN - ATTRIBUTE_HEADER_LEN,
                Attribute::CryptoBindingRequest { .. } => {
                    CRYPTO_BINDING_REQUEST_LEN - ATTRIBUTE_HEADER_LEN
                }
                Attribute::Unknown { value, .. } => value.len(),
            }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        ensure(buf, ATTRIBUTE_HEADER_LEN, ATTRIBUTE_UNIT)?;
        let _reserved = buf.get_u8();
        let id = buf.get_u8();
        let declared = (buf.get_u16() & LENGTH_MASK) as usize;
        if declared < ATTRIBUTE_HEADER_LEN {
            return Err(ParseError::InvalidField {
                unit: ATTRIBUTE_UNIT,
                field: "length",
                value: declared as u32,
            });
        }
        ensure(buf, declared - ATTRIBUTE_HEADER_LEN, ATTRIBUTE_UNIT)?;
        let mut body = buf.split_to(declared - ATTRIBUTE_HEADER_LEN);

        let fixed = |expected: usize| {
            if declared != expected {
                Err(ParseError::LengthMismatch {
                    unit: ATTRIBUTE_UNIT,
                    declared,
                    actual: expected,
                })
            } else {
                Ok(())
            }
        };

        let attribute = match id {
            1 => {
                fixed(ATTRIBUTE_HEADER_LEN + 2)?;
                Attribute::EncapsulatedProtocol(body.get_u16())
            }
            2 => {
                if body.len() < 8 || body.len() > 8 + MAX_STATUS_VALUE {
                    return Err(ParseError::LengthMismatch {
                        unit: ATTRIBUTE_UNIT,
                        declared,
                        actual: body.len() + ATTRIBUTE_HEADER_LEN,
                    });
                }
                body.advance(3);
                let attribute_id = body.get_u8();
                let status = body.get_u32();
                Attribute::StatusInfo {
                    attribute_id,
                    status,
                    value: body.split_off(0),
                }
            }
            3 => {
                fixed(CRYPTO_BINDING_LEN)?;
                body.advance(3);
                let hash_protocol = body.get_u8();
                let mut binding = CryptoBinding {
                    hash_protocol,
                    nonce: [0; NONCE_LEN],
                    cert_hash: [0; 32],
                    compound_mac: [0; 32],
                };
                body.copy_to_slice(&mut binding.nonce);
                body.copy_to_slice(&mut binding.cert_hash);
                body.copy_to_slice(&mut binding.compound_mac);
                Attribute::CryptoBinding(binding)
            }
            4 => {
                fixed(CRYPTO_BINDING_REQUEST_LEN)?;
                body.advance(3);
                let hash_bitmask = body.get_u8();
                let mut nonce = [0; NONCE_LEN];
                body.copy_to_slice(&mut nonce);
                Attribute::CryptoBindingRequest {
                    hash_bitmask,
                    nonce,
                }
            }
            _ => Attribute::Unknown {
                id,
                value: body.split_off(0),
            },
        };
        finished(&body, declared, ATTRIBUTE_UNIT)?;
        Ok(attribute)
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u8(self.id());
        buf.put_u16(self.length() as u16);
        match self {
            Attribute::EncapsulatedProtocol(protocol) => buf.put_u16(*protocol),
            Attribute::StatusInfo {
                attribute_id,
                status,
                value,
            } => {
                buf.put_bytes(0, 3);
                buf.put_u8(*attribute_id);
                buf.put_u32(*status);
                buf.put_slice(value);
            }
            Attribute::CryptoBinding(binding) => {
                buf.put_bytes(0, 3);
                buf.put_u8(binding.hash_protocol);
                buf.put_slice(&binding.nonce);
                buf.put_slice(&binding.cert_hash);
                buf.put_slice(&binding.compound_mac);
            }
            Attribute::CryptoBindingRequest {
                hash_bitmask,
                nonce,
            } => {
                buf.put_bytes(0, 3);
                buf.put_u8(*hash_bitmask);
                buf.put_slice(nonce);
            }
            Attribute::Unknown { value, .. } => buf.put_slice(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub message_type: MessageType,
    pub attributes: Vec<Attribute>,
}

impl ControlPacket {
    pub fn new(message_type: MessageType, attributes: Vec<Attribute>) -> Self {
        Self {
            message_type,
            attributes,
        }
    }

    /// A packet without attributes (echo, disconnect ack)
    pub fn bare(message_type: MessageType) -> Self {
        Self::new(message_type, Vec::new())
    }

    pub fn connect_request() -> Self {
        Self::new(
            MessageType::CallConnectRequest,
            vec![Attribute::EncapsulatedProtocol(ENCAPSULATED_PROTOCOL_PPP)],
        )
    }

    pub fn call_connected(binding: CryptoBinding) -> Self {
        Self::new(
            MessageType::CallConnected,
            vec![Attribute::CryptoBinding(binding)],
        )
    }

    /// Hash bitmask and nonce offered in a Call-Connect-Ack
    pub fn crypto_binding_request(&self) -> Option<(u8, [u8; NONCE_LEN])> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::CryptoBindingRequest {
                hash_bitmask,
                nonce,
            } => Some((*hash_bitmask, *nonce)),
            _ => None,
        })
    }

    /// Human readable status attributes, for diagnostics
    pub fn status_summary(&self) -> Option<String> {
        let statuses: Vec<String> = self
            .attributes
            .iter()
            .filter_map(|attribute| match attribute {
                Attribute::StatusInfo {
                    attribute_id,
                    status,
                    ..
                } => Some(format!("attribute {attribute_id}: status {status:#010x}")),
                _ => None,
            })
            .collect();
        (!statuses.is_empty()).then(|| statuses.join(", "))
    }
}

impl WireUnit for ControlPacket {
    fn length(&self) -> usize {
        CONTROL_HEADER_LEN + self.attributes.iter().map(|a| a.length()).sum::<usize>()
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        ensure(buf, CONTROL_HEADER_LEN, PACKET_UNIT)?;
        let version = buf.get_u8();
        if version != SSTP_VERSION {
            return Err(ParseError::InvalidField {
                unit: PACKET_UNIT,
                field: "version",
                value: version as u32,
            });
        }
        let flag = buf.get_u8();
        if flag != CONTROL_FLAG {
            return Err(ParseError::InvalidField {
                unit: PACKET_UNIT,
                field: "control flag",
                value: flag as u32,
            });
        }
        let declared = (buf.get_u16() & LENGTH_MASK) as usize;
        if declared < CONTROL_HEADER_LEN {
            return Err(ParseError::InvalidField {
                unit: PACKET_UNIT,
                field: "length",
                value: declared as u32,
            });
        }
        let message_type = MessageType::try_from(buf.get_u16())?;
        let count = buf.get_u16() as usize;

        ensure(buf, declared - CONTROL_HEADER_LEN, PACKET_UNIT)?;
        let mut body = buf.split_to(declared - CONTROL_HEADER_LEN);
        let mut attributes = Vec::with_capacity(count.min(8));
        while body.has_remaining() {
            attributes.push(Attribute::decode(&mut body)?);
        }
        if attributes.len() != count {
            return Err(ParseError::LengthMismatch {
                unit: PACKET_UNIT,
                declared: count,
                actual: attributes.len(),
            });
        }

        Ok(Self {
            message_type,
            attributes,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(SSTP_VERSION);
        buf.put_u8(CONTROL_FLAG);
        buf.put_u16(self.length() as u16);
        buf.put_u16(self.message_type as u16);
        buf.put_u16(self.attributes.len() as u16);
        for attribute in &self.attributes {
            attribute.encode(buf);
        }
    }
}

/// A PPP frame carried in an SSTP data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub protocol: u16,
    pub payload: Bytes,
}

impl WireUnit for DataPacket {
    fn length(&self) -> usize {
        DATA_PREFIX_LEN + self.payload.len()
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        ensure(buf, 4, DATA_UNIT)?;
        let version = buf.get_u8();
        if version != SSTP_VERSION {
            return Err(ParseError::InvalidField {
                unit: DATA_UNIT,
                field: "version",
                value: version as u32,
            });
        }
        let flag = buf.get_u8();
        if flag != DATA_FLAG {
            return Err(ParseError::InvalidField {
                unit: DATA_UNIT,
                field: "control flag",
                value: flag as u32,
            });
        }
        let declared = (buf.get_u16() & LENGTH_MASK) as usize;
        if declared < DATA_PREFIX_LEN {
            return Err(ParseError::InvalidField {
                unit: DATA_UNIT,
                field: "length",
                value: declared as u32,
            });
        }
        ensure(buf, declared - 4, DATA_UNIT)?;
        let mut body = buf.split_to(declared - 4);
        let address = body.get_u8();
        let control = body.get_u8();
        if address != HDLC_ADDRESS || control != HDLC_CONTROL {
            return Err(ParseError::InvalidField {
                unit: DATA_UNIT,
                field: "HDLC address/control",
                value: u16::from_be_bytes([address, control]) as u32,
            });
        }
        let protocol = body.get_u16();
        Ok(Self {
            protocol,
            payload: body,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_data_prefix(buf, self.protocol, self.payload.len());
        buf.put_slice(&self.payload);
    }
}

/// Writes the 8-byte header in front of a PPP payload of `payload_len` bytes
pub fn put_data_prefix(buf: &mut BytesMut, protocol: u16, payload_len: usize) {
    buf.put_u8(SSTP_VERSION);
    buf.put_u8(DATA_FLAG);
    buf.put_u16((DATA_PREFIX_LEN + payload_len) as u16 & LENGTH_MASK);
    buf.put_u8(HDLC_ADDRESS);
    buf.put_u8(HDLC_CONTROL);
    buf.put_u16(protocol);
}

/// Declared length of the packet starting at `buf`, once its header is visible
pub fn peek_packet_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    Some((u16::from_be_bytes([buf[2], buf[3]]) & LENGTH_MASK) as usize)
}

/// Whether the packet starting at `buf` is a control packet
pub fn is_control(buf: &[u8]) -> bool {
    buf.get(1) == Some(&CONTROL_FLAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: &ControlPacket) -> ControlPacket {
        let mut bytes = packet.to_bytes();
        assert_eq!(bytes.len(), packet.length());
        let decoded = ControlPacket::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn test_connect_request_bytes() {
        let packet = ControlPacket::connect_request();
        assert_eq!(
            packet.to_bytes().as_ref(),
            &[0x10, 0x01, 0x00, 0x0E, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x00, 0x01]
        );
        assert_eq!(round_trip(&packet), packet);
    }

    #[test]
    fn test_control_round_trip_all_attributes() {
        let packet = ControlPacket::new(
            MessageType::CallConnectAck,
            vec![
                Attribute::CryptoBindingRequest {
                    hash_bitmask: 0x03,
                    nonce: [7; 32],
                },
                Attribute::StatusInfo {
                    attribute_id: 1,
                    status: 0x0000_0004,
                    value: Bytes::from_static(b"\x00\x01\x00\x06\x00\x02"),
                },
                Attribute::Unknown {
                    id: 9,
                    value: Bytes::from_static(b"opaque"),
                },
            ],
        );
        assert_eq!(round_trip(&packet), packet);
        assert_eq!(packet.crypto_binding_request(), Some((0x03, [7; 32])));
        assert!(packet.status_summary().unwrap().contains("status 0x00000004"));
    }

    #[test]
    fn test_call_connected_length() {
        let packet = ControlPacket::call_connected(CryptoBinding {
            hash_protocol: HashProtocol::Sha256 as u8,
            nonce: [1; 32],
            cert_hash: [2; 32],
            compound_mac: [3; 32],
        });
        assert_eq!(packet.length(), 112);
        assert_eq!(round_trip(&packet), packet);
    }

    #[test]
    fn test_attribute_count_mismatch() {
        let mut bytes = BytesMut::new();
        ControlPacket::connect_request().encode(&mut bytes);
        bytes[7] = 2;
        let err = ControlPacket::decode(&mut bytes.freeze()).unwrap_err();
        assert!(matches!(err, ParseError::LengthMismatch { .. }));
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        let mut bytes = BytesMut::new();
        ControlPacket::connect_request().encode(&mut bytes);
        bytes[3] = 0x20;
        let err = ControlPacket::decode(&mut bytes.freeze()).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut bytes = Bytes::from_static(&[0x10, 0x01, 0x00, 0x08, 0x00, 0x0A, 0x00, 0x00]);
        assert_eq!(
            ControlPacket::decode(&mut bytes),
            Err(ParseError::UnknownType {
                unit: PACKET_UNIT,
                value: 0x0A
            })
        );
    }

    #[test]
    fn test_fixed_attribute_length_enforced() {
        let mut bytes = Bytes::from_static(&[0x00, 0x04, 0x00, 0x08, 0, 0, 0, 2]);
        assert!(matches!(
            Attribute::decode(&mut bytes),
            Err(ParseError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_data_packet() {
        let packet = DataPacket {
            protocol: 0x0021,
            payload: Bytes::from_static(&[0x45, 0, 0, 20]),
        };
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[..8], &[0x10, 0x00, 0x00, 0x0C, 0xFF, 0x03, 0x00, 0x21]);
        assert_eq!(peek_packet_length(&bytes), Some(12));
        assert!(!is_control(&bytes));
        assert_eq!(DataPacket::decode(&mut bytes.clone()).unwrap(), packet);

        let mut bad = BytesMut::from(&bytes[..]);
        bad[4] = 0x00;
        assert!(DataPacket::decode(&mut bad.freeze()).is_err());
    }

    #[test]
    fn test_hash_protocol_preference() {
        assert_eq!(HashProtocol::from_bitmask(0x03), Some(HashProtocol::Sha256));
        assert_eq!(HashProtocol::from_bitmask(0x01), Some(HashProtocol::Sha1));
        assert_eq!(HashProtocol::from_bitmask(0x00), None);
    }
}
