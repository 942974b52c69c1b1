//! PPP frame headers: protocol numbers, Configure frames and LCP frames

use super::lcp::LcpOptions;
use super::options::OptionPack;
use super::unit::{declared_length, ensure, WireUnit};
use crate::error::ParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// PPP protocol numbers
pub mod protocol {
    pub const IPV4: u16 = 0x0021;
    pub const IPV6: u16 = 0x0057;
    pub const IPCP: u16 = 0x8021;
    pub const IPV6CP: u16 = 0x8057;
    pub const LCP: u16 = 0xC021;
    pub const PAP: u16 = 0xC023;
    pub const CHAP: u16 = 0xC223;
    pub const EAP: u16 = 0xC227;

    pub fn name(protocol: u16) -> &'static str {
        match protocol {
            IPV4 => "IPv4",
            IPV6 => "IPv6",
            IPCP => "IPCP",
            IPV6CP => "IPv6CP",
            LCP => "LCP",
            PAP => "PAP",
            CHAP => "CHAP",
            EAP => "EAP",
            _ => "unknown",
        }
    }
}

/// LCP codes (Configure codes 1-4 are shared with the NCPs)
pub mod code {
    pub const CONFIGURE_REQUEST: u8 = 1;
    pub const CONFIGURE_ACK: u8 = 2;
    pub const CONFIGURE_NAK: u8 = 3;
    pub const CONFIGURE_REJECT: u8 = 4;
    pub const TERMINATE_REQUEST: u8 = 5;
    pub const TERMINATE_ACK: u8 = 6;
    pub const CODE_REJECT: u8 = 7;
    pub const PROTOCOL_REJECT: u8 = 8;
    pub const ECHO_REQUEST: u8 = 9;
    pub const ECHO_REPLY: u8 = 10;
    pub const DISCARD_REQUEST: u8 = 11;
}

pub const FRAME_HEADER_LEN: usize = 4;

pub fn is_configure_code(code: u8) -> bool {
    (code::CONFIGURE_REQUEST..=code::CONFIGURE_REJECT).contains(&code)
}

pub fn is_known_lcp_code(code: u8) -> bool {
    (code::CONFIGURE_REQUEST..=code::DISCARD_REQUEST).contains(&code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigureCode {
    Request = code::CONFIGURE_REQUEST,
    Ack = code::CONFIGURE_ACK,
    Nak = code::CONFIGURE_NAK,
    Reject = code::CONFIGURE_REJECT,
}

impl ConfigureCode {
    fn parse(value: u8, unit: &'static str) -> Result<Self, ParseError> {
        Ok(match value {
            code::CONFIGURE_REQUEST => ConfigureCode::Request,
            code::CONFIGURE_ACK => ConfigureCode::Ack,
            code::CONFIGURE_NAK => ConfigureCode::Nak,
            code::CONFIGURE_REJECT => ConfigureCode::Reject,
            other => {
                return Err(ParseError::UnknownType {
                    unit,
                    value: other as u32,
                })
            }
        })
    }
}

/// Configure-Request/Ack/Nak/Reject of LCP, IPCP or IPv6CP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureFrame<P: OptionPack> {
    pub code: ConfigureCode,
    pub id: u8,
    pub options: P,
}

impl<P: OptionPack> ConfigureFrame<P> {
    pub fn new(code: ConfigureCode, id: u8, options: P) -> Self {
        Self { code, id, options }
    }
}

impl<P: OptionPack> WireUnit for ConfigureFrame<P> {
    fn length(&self) -> usize {
        FRAME_HEADER_LEN + self.options.pack_length()
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        ensure(buf, FRAME_HEADER_LEN, P::NAME)?;
        let code = ConfigureCode::parse(buf.get_u8(), P::NAME)?;
        let id = buf.get_u8();
        let declared = declared_length(buf, FRAME_HEADER_LEN, P::NAME)?;
        ensure(buf, declared - FRAME_HEADER_LEN, P::NAME)?;
        let options = P::decode_pack(buf.split_to(declared - FRAME_HEADER_LEN))?;
        Ok(Self { code, id, options })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code as u8);
        buf.put_u8(self.id);
        buf.put_u16(self.length() as u16);
        self.options.encode_pack(buf);
    }
}

const LCP_UNIT: &str = "LCP frame";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LcpFrame {
    Configure(ConfigureFrame<LcpOptions>),
    TerminateRequest { id: u8, data: Bytes },
    TerminateAck { id: u8, data: Bytes },
    CodeReject { id: u8, rejected: Bytes },
    ProtocolReject { id: u8, protocol: u16, info: Bytes },
    EchoRequest { id: u8, magic: u32, data: Bytes },
    EchoReply { id: u8, magic: u32, data: Bytes },
    DiscardRequest { id: u8, magic: u32, data: Bytes },
}

impl LcpFrame {
    pub fn code(&self) -> u8 {
        match self {
            LcpFrame::Configure(frame) => frame.code as u8,
            LcpFrame::TerminateRequest { .. } => code::TERMINATE_REQUEST,
            LcpFrame::TerminateAck { .. } => code::TERMINATE_ACK,
            LcpFrame::CodeReject { .. } => code::CODE_REJECT,
            LcpFrame::ProtocolReject { .. } => code::PROTOCOL_REJECT,
            LcpFrame::EchoRequest { .. } => code::ECHO_REQUEST,
            LcpFrame::EchoReply { .. } => code::ECHO_REPLY,
            LcpFrame::DiscardRequest { .. } => code::DISCARD_REQUEST,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            LcpFrame::Configure(frame) => frame.id,
            LcpFrame::TerminateRequest { id, .. }
            | LcpFrame::TerminateAck { id, .. }
            | LcpFrame::CodeReject { id, .. }
            | LcpFrame::ProtocolReject { id, .. }
            | LcpFrame::EchoRequest { id, .. }
            | LcpFrame::EchoReply { id, .. }
            | LcpFrame::DiscardRequest { id, .. } => *id,
        }
    }

    fn body_length(&self) -> usize {
        match self {
            LcpFrame::Configure(frame) => frame.options.pack_length(),
            LcpFrame::TerminateRequest { data, .. } | LcpFrame::TerminateAck { data, .. } => {
                data.len()
            }
            LcpFrame::CodeReject { rejected, .. } => rejected.len(),
            LcpFrame::ProtocolReject { info, .. } => 2 + info.len(),
            LcpFrame::EchoRequest { data, .. }
            | LcpFrame::EchoReply { data, .. }
            | LcpFrame::DiscardRequest { data, .. } => 4 + data.len(),
        }
    }
}

impl WireUnit for LcpFrame {
    fn length(&self) -> usize {
        FRAME_HEADER_LEN + self.body_length()
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        ensure(buf, FRAME_HEADER_LEN, LCP_UNIT)?;
        let frame_code = buf[0];
        if is_configure_code(frame_code) {
            return Ok(LcpFrame::Configure(ConfigureFrame::decode(buf)?));
        }
        if !is_known_lcp_code(frame_code) {
            return Err(ParseError::UnknownType {
                unit: LCP_UNIT,
                value: frame_code as u32,
            });
        }
        buf.advance(1);
        let id = buf.get_u8();
        let declared = declared_length(buf, FRAME_HEADER_LEN, LCP_UNIT)?;
        ensure(buf, declared - FRAME_HEADER_LEN, LCP_UNIT)?;
        let mut body = buf.split_to(declared - FRAME_HEADER_LEN);

        let magic = |body: &mut Bytes| -> Result<u32, ParseError> {
            ensure(body, 4, LCP_UNIT)?;
            Ok(body.get_u32())
        };

        Ok(match frame_code {
            code::TERMINATE_REQUEST => LcpFrame::TerminateRequest { id, data: body },
            code::TERMINATE_ACK => LcpFrame::TerminateAck { id, data: body },
            code::CODE_REJECT => LcpFrame::CodeReject { id, rejected: body },
            code::PROTOCOL_REJECT => {
                ensure(&body, 2, LCP_UNIT)?;
                let protocol = body.get_u16();
                LcpFrame::ProtocolReject {
                    id,
                    protocol,
                    info: body,
                }
            }
            code::ECHO_REQUEST => LcpFrame::EchoRequest {
                id,
                magic: magic(&mut body)?,
                data: body,
            },
            code::ECHO_REPLY => LcpFrame::EchoReply {
                id,
                magic: magic(&mut body)?,
                data: body,
            },
            _ => LcpFrame::DiscardRequest {
                id,
                magic: magic(&mut body)?,
                data: body,
            },
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        if let LcpFrame::Configure(frame) = self {
            frame.encode(buf);
            return;
        }
        buf.put_u8(self.code());
        buf.put_u8(self.id());
        buf.put_u16(self.length() as u16);
        match self {
            LcpFrame::Configure(_) => {}
            LcpFrame::TerminateRequest { data, .. } | LcpFrame::TerminateAck { data, .. } => {
                buf.put_slice(data)
            }
            LcpFrame::CodeReject { rejected, .. } => buf.put_slice(rejected),
            LcpFrame::ProtocolReject { protocol, info, .. } => {
                buf.put_u16(*protocol);
                buf.put_slice(info);
            }
            LcpFrame::EchoRequest { magic, data, .. }
            | LcpFrame::EchoReply { magic, data, .. }
            | LcpFrame::DiscardRequest { magic, data, .. } => {
                buf.put_u32(*magic);
                buf.put_slice(data);
            }
        }
    }
}
