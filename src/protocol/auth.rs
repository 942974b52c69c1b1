//! PAP, CHAP and EAP frames

use super::unit::{declared_length, ensure, finished, length_prefixed, WireUnit};
use super::ppp::FRAME_HEADER_LEN;
use crate::error::ParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Reads code, id and the declared body of an authentication frame
fn split_frame(buf: &mut Bytes, unit: &'static str) -> Result<(u8, u8, Bytes, usize), ParseError> {
    ensure(buf, FRAME_HEADER_LEN, unit)?;
    let code = buf.get_u8();
    let id = buf.get_u8();
    let declared = declared_length(buf, FRAME_HEADER_LEN, unit)?;
    ensure(buf, declared - FRAME_HEADER_LEN, unit)?;
    Ok((code, id, buf.split_to(declared - FRAME_HEADER_LEN), declared))
}

fn put_header(buf: &mut BytesMut, code: u8, id: u8, length: usize) {
    buf.put_u8(code);
    buf.put_u8(id);
    buf.put_u16(length as u16);
}

const PAP_UNIT: &str = "PAP frame";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PapFrame {
    Request {
        id: u8,
        peer_id: Bytes,
        password: Bytes,
    },
    Ack {
        id: u8,
        message: Bytes,
    },
    Nak {
        id: u8,
        message: Bytes,
    },
}

impl WireUnit for PapFrame {
    fn length(&self) -> usize {
        FRAME_HEADER_LEN
            + match self {
                PapFrame::Request {
                    peer_id, password, ..
                } => 2 + peer_id.len() + password.len(),
                PapFrame::Ack { message, .. } | PapFrame::Nak { message, .. } => {
                    1 + message.len()
                }
            }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        let (code, id, mut body, declared) = split_frame(buf, PAP_UNIT)?;
        let frame = match code {
            1 => {
                let peer_id = length_prefixed(&mut body, PAP_UNIT)?;
                let password = length_prefixed(&mut body, PAP_UNIT)?;
                PapFrame::Request {
                    id,
                    peer_id,
                    password,
                }
            }
            2 | 3 => {
                // some servers omit the message length byte entirely
                let message = if body.has_remaining() {
                    length_prefixed(&mut body, PAP_UNIT)?
                } else {
                    Bytes::new()
                };
                if code == 2 {
                    PapFrame::Ack { id, message }
                } else {
                    PapFrame::Nak { id, message }
                }
            }
            other => {
                return Err(ParseError::UnknownType {
                    unit: PAP_UNIT,
                    value: other as u32,
                })
            }
        };
        finished(&body, declared, PAP_UNIT)?;
        Ok(frame)
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            PapFrame::Request {
                id,
                peer_id,
                password,
            } => {
                put_header(buf, 1, *id, self.length());
                buf.put_u8(peer_id.len() as u8);
                buf.put_slice(peer_id);
                buf.put_u8(password.len() as u8);
                buf.put_slice(password);
            }
            PapFrame::Ack { id, message } | PapFrame::Nak { id, message } => {
                let code = if matches!(self, PapFrame::Ack { .. }) { 2 } else { 3 };
                put_header(buf, code, *id, self.length());
                buf.put_u8(message.len() as u8);
                buf.put_slice(message);
            }
        }
    }
}

const CHAP_UNIT: &str = "CHAP frame";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapFrame {
    Challenge { id: u8, value: Bytes, name: Bytes },
    Response { id: u8, value: Bytes, name: Bytes },
    Success { id: u8, message: Bytes },
    Failure { id: u8, message: Bytes },
}

impl ChapFrame {
    fn code(&self) -> u8 {
        match self {
            ChapFrame::Challenge { .. } => 1,
            ChapFrame::Response { .. } => 2,
            ChapFrame::Success { .. } => 3,
            ChapFrame::Failure { .. } => 4,
        }
    }
}

impl WireUnit for ChapFrame {
    fn length(&self) -> usize {
        FRAME_HEADER_LEN
            + match self {
                ChapFrame::Challenge { value, name, .. }
                | ChapFrame::Response { value, name, .. } => 1 + value.len() + name.len(),
                ChapFrame::Success { message, .. } | ChapFrame::Failure { message, .. } => {
                    message.len()
                }
            }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        let (code, id, mut body, _) = split_frame(buf, CHAP_UNIT)?;
        Ok(match code {
            1 | 2 => {
                let value = length_prefixed(&mut body, CHAP_UNIT)?;
                if code == 1 {
                    ChapFrame::Challenge {
                        id,
                        value,
                        name: body,
                    }
                } else {
                    ChapFrame::Response {
                        id,
                        value,
                        name: body,
                    }
                }
            }
            3 => ChapFrame::Success { id, message: body },
            4 => ChapFrame::Failure { id, message: body },
            other => {
                return Err(ParseError::UnknownType {
                    unit: CHAP_UNIT,
                    value: other as u32,
                })
            }
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_header(buf, self.code(), self.id(), self.length());
        match self {
            ChapFrame::Challenge { value, name, .. } | ChapFrame::Response { value, name, .. } => {
                buf.put_u8(value.len() as u8);
                buf.put_slice(value);
                buf.put_slice(name);
            }
            ChapFrame::Success { message, .. } | ChapFrame::Failure { message, .. } => {
                buf.put_slice(message)
            }
        }
    }
}

impl ChapFrame {
    pub fn id(&self) -> u8 {
        match self {
            ChapFrame::Challenge { id, .. }
            | ChapFrame::Response { id, .. }
            | ChapFrame::Success { id, .. }
            | ChapFrame::Failure { id, .. } => *id,
        }
    }
}

/// EAP method types
pub mod eap_type {
    pub const IDENTITY: u8 = 1;
    pub const NAK: u8 = 3;
    pub const MSCHAPV2: u8 = 26;
}

const EAP_UNIT: &str = "EAP frame";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapFrame {
    Request { id: u8, kind: u8, data: Bytes },
    Response { id: u8, kind: u8, data: Bytes },
    Success { id: u8 },
    Failure { id: u8 },
}

impl WireUnit for EapFrame {
    fn length(&self) -> usize {
        FRAME_HEADER_LEN
            + match self {
                EapFrame::Request { data, .. } | EapFrame::Response { data, .. } => 1 + data.len(),
                EapFrame::Success { .. } | EapFrame::Failure { .. } => 0,
            }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        let (code, id, mut body, declared) = split_frame(buf, EAP_UNIT)?;
        let frame = match code {
            1 | 2 => {
                ensure(&body, 1, EAP_UNIT)?;
                let kind = body.get_u8();
                let data = body.split_off(0);
                if code == 1 {
                    EapFrame::Request { id, kind, data }
                } else {
                    EapFrame::Response { id, kind, data }
                }
            }
            3 => EapFrame::Success { id },
            4 => EapFrame::Failure { id },
            other => {
                return Err(ParseError::UnknownType {
                    unit: EAP_UNIT,
                    value: other as u32,
                })
            }
        };
        finished(&body, declared, EAP_UNIT)?;
        Ok(frame)
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            EapFrame::Request { id, kind, data } | EapFrame::Response { id, kind, data } => {
                let code = if matches!(self, EapFrame::Request { .. }) { 1 } else { 2 };
                put_header(buf, code, *id, self.length());
                buf.put_u8(*kind);
                buf.put_slice(data);
            }
            EapFrame::Success { id } => put_header(buf, 3, *id, FRAME_HEADER_LEN),
            EapFrame::Failure { id } => put_header(buf, 4, *id, FRAME_HEADER_LEN),
        }
    }
}

/// MS-CHAPv2 opcodes inside EAP type-data
pub mod mschapv2_opcode {
    pub const CHALLENGE: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const SUCCESS: u8 = 3;
    pub const FAILURE: u8 = 4;
}

const MSCHAPV2_UNIT: &str = "EAP-MSCHAPv2 data";
const MSCHAPV2_HEADER_LEN: usize = 4;

/// Type-data of an EAP-MSCHAPv2 Request or Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsChapV2Packet {
    Challenge { ms_id: u8, value: Bytes, name: Bytes },
    Response { ms_id: u8, value: Bytes, name: Bytes },
    Success { ms_id: u8, message: Bytes },
    Failure { ms_id: u8, message: Bytes },
    /// The peer's one-byte reply to Success or Failure
    Acknowledge { opcode: u8 },
}

impl WireUnit for MsChapV2Packet {
    fn length(&self) -> usize {
        match self {
            MsChapV2Packet::Challenge { value, name, .. }
            | MsChapV2Packet::Response { value, name, .. } => {
                MSCHAPV2_HEADER_LEN + 1 + value.len() + name.len()
            }
            MsChapV2Packet::Success { message, .. } | MsChapV2Packet::Failure { message, .. } => {
                MSCHAPV2_HEADER_LEN + message.len()
            }
            MsChapV2Packet::Acknowledge { .. } => 1,
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        ensure(buf, 1, MSCHAPV2_UNIT)?;
        let opcode = buf.get_u8();
        if !buf.has_remaining()
            && (opcode == mschapv2_opcode::SUCCESS || opcode == mschapv2_opcode::FAILURE)
        {
            return Ok(MsChapV2Packet::Acknowledge { opcode });
        }
        ensure(buf, MSCHAPV2_HEADER_LEN - 1, MSCHAPV2_UNIT)?;
        let ms_id = buf.get_u8();
        let declared = buf.get_u16() as usize;
        if declared < MSCHAPV2_HEADER_LEN {
            return Err(ParseError::InvalidField {
                unit: MSCHAPV2_UNIT,
                field: "MS-Length",
                value: declared as u32,
            });
        }
        ensure(buf, declared - MSCHAPV2_HEADER_LEN, MSCHAPV2_UNIT)?;
        let mut body = buf.split_to(declared - MSCHAPV2_HEADER_LEN);
        Ok(match opcode {
            mschapv2_opcode::CHALLENGE | mschapv2_opcode::RESPONSE => {
                let value = length_prefixed(&mut body, MSCHAPV2_UNIT)?;
                if opcode == mschapv2_opcode::CHALLENGE {
                    MsChapV2Packet::Challenge {
                        ms_id,
                        value,
                        name: body,
                    }
                } else {
                    MsChapV2Packet::Response {
                        ms_id,
                        value,
                        name: body,
                    }
                }
            }
            mschapv2_opcode::SUCCESS => MsChapV2Packet::Success {
                ms_id,
                message: body,
            },
            mschapv2_opcode::FAILURE => MsChapV2Packet::Failure {
                ms_id,
                message: body,
            },
            other => {
                return Err(ParseError::UnknownType {
                    unit: MSCHAPV2_UNIT,
                    value: other as u32,
                })
            }
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let length = self.length();
        match self {
            MsChapV2Packet::Challenge { ms_id, value, name }
            | MsChapV2Packet::Response { ms_id, value, name } => {
                let opcode = if matches!(self, MsChapV2Packet::Challenge { .. }) {
                    mschapv2_opcode::CHALLENGE
                } else {
                    mschapv2_opcode::RESPONSE
                };
                put_header(buf, opcode, *ms_id, length);
                buf.put_u8(value.len() as u8);
                buf.put_slice(value);
                buf.put_slice(name);
            }
            MsChapV2Packet::Success { ms_id, message } | MsChapV2Packet::Failure { ms_id, message } => {
                let opcode = if matches!(self, MsChapV2Packet::Success { .. }) {
                    mschapv2_opcode::SUCCESS
                } else {
                    mschapv2_opcode::FAILURE
                };
                put_header(buf, opcode, *ms_id, length);
                buf.put_slice(message);
            }
            MsChapV2Packet::Acknowledge { opcode } => buf.put_u8(*opcode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pap_request_bytes() {
        let frame = PapFrame::Request {
            id: 7,
            peer_id: Bytes::from_static(b"user"),
            password: Bytes::from_static(b"pw"),
        };
        let mut bytes = frame.to_bytes();
        assert_eq!(
            bytes.as_ref(),
            &[1, 7, 0, 12, 4, b'u', b's', b'e', b'r', 2, b'p', b'w']
        );
        assert_eq!(PapFrame::decode(&mut bytes).unwrap(), frame);
    }

    #[test]
    fn test_pap_ack_and_nak() {
        let nak = PapFrame::Nak {
            id: 1,
            message: Bytes::from_static(b"denied"),
        };
        assert_eq!(PapFrame::decode(&mut nak.to_bytes()).unwrap(), nak);

        let mut bare_ack = Bytes::from_static(&[2, 1, 0, 4]);
        assert_eq!(
            PapFrame::decode(&mut bare_ack).unwrap(),
            PapFrame::Ack {
                id: 1,
                message: Bytes::new()
            }
        );
    }

    #[test]
    fn test_pap_unreachable_length() {
        // password length points past the declared frame end
        let mut bytes = Bytes::from_static(&[1, 1, 0, 8, 1, b'u', 9, b'p', 0, 0]);
        assert!(matches!(
            PapFrame::decode(&mut bytes),
            Err(ParseError::Truncated { .. })
        ));

        // message shorter than the declared frame leaves trailing bytes
        let mut bytes = Bytes::from_static(&[2, 1, 0, 7, 1, b'o', b'x']);
        assert!(matches!(
            PapFrame::decode(&mut bytes),
            Err(ParseError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_chap_round_trip() {
        let frames = [
            ChapFrame::Challenge {
                id: 1,
                value: Bytes::from(vec![0xAB; 16]),
                name: Bytes::from_static(b"gateway"),
            },
            ChapFrame::Response {
                id: 1,
                value: Bytes::from(vec![0xCD; 49]),
                name: Bytes::from_static(b"User"),
            },
            ChapFrame::Success {
                id: 1,
                message: Bytes::from_static(b"S=0123 M=ok"),
            },
            ChapFrame::Failure {
                id: 1,
                message: Bytes::from_static(b"E=691 R=0"),
            },
        ];
        for frame in frames {
            let mut bytes = frame.to_bytes();
            assert_eq!(bytes.len(), frame.length());
            assert_eq!(ChapFrame::decode(&mut bytes).unwrap(), frame);
        }
    }

    #[test]
    fn test_eap_frames() {
        let success = EapFrame::Success { id: 4 };
        assert_eq!(success.to_bytes().as_ref(), &[3, 4, 0, 4]);
        let request = EapFrame::Request {
            id: 2,
            kind: eap_type::IDENTITY,
            data: Bytes::new(),
        };
        assert_eq!(EapFrame::decode(&mut request.to_bytes()).unwrap(), request);
    }

    #[test]
    fn test_mschapv2_inside_eap() {
        let challenge = MsChapV2Packet::Challenge {
            ms_id: 9,
            value: Bytes::from(vec![1; 16]),
            name: Bytes::from_static(b"srv"),
        };
        let data = challenge.to_bytes();
        assert_eq!(&data[..5], &[1, 9, 0, 24, 16]);
        assert_eq!(MsChapV2Packet::decode(&mut data.clone()).unwrap(), challenge);

        let ack = MsChapV2Packet::Acknowledge {
            opcode: mschapv2_opcode::SUCCESS,
        };
        assert_eq!(ack.to_bytes().as_ref(), &[3]);
        assert_eq!(MsChapV2Packet::decode(&mut ack.to_bytes()).unwrap(), ack);

        let success = MsChapV2Packet::Success {
            ms_id: 9,
            message: Bytes::from_static(b"S=00 M=hi"),
        };
        assert_eq!(MsChapV2Packet::decode(&mut success.to_bytes()).unwrap(), success);
    }
}
