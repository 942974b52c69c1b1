//! LCP option pack

use super::options::{expect_len, put_option_header, OptionOrder, OptionPack, UnknownOption};
use super::ppp::protocol;
use crate::error::ParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const OPTION_MRU: u8 = 1;
pub const OPTION_AUTH: u8 = 3;

/// Algorithm byte following the CHAP protocol number for MS-CHAPv2
pub const CHAP_ALGORITHM_MSCHAPV2: u8 = 0x81;

/// Smallest MRU a peer may ask for
pub const MIN_MRU: u16 = 68;

const UNIT: &str = "LCP option";

/// Authentication-Protocol option value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOption {
    pub protocol: u16,
    pub algorithm: Option<u8>,
}

impl AuthOption {
    pub const PAP: AuthOption = AuthOption {
        protocol: protocol::PAP,
        algorithm: None,
    };
    pub const MSCHAPV2: AuthOption = AuthOption {
        protocol: protocol::CHAP,
        algorithm: Some(CHAP_ALGORITHM_MSCHAPV2),
    };
    pub const EAP: AuthOption = AuthOption {
        protocol: protocol::EAP,
        algorithm: None,
    };

    fn data_len(&self) -> usize {
        2 + self.algorithm.map_or(0, |_| 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LcpOptions {
    mru: Option<u16>,
    auth: Option<AuthOption>,
    unknown: Vec<UnknownOption>,
    order: OptionOrder,
}

impl LcpOptions {
    pub fn mru(&self) -> Option<u16> {
        self.mru
    }

    pub fn set_mru(&mut self, mru: u16) {
        self.mru = Some(mru);
        self.order.touch(OPTION_MRU);
    }

    pub fn auth(&self) -> Option<AuthOption> {
        self.auth
    }

    pub fn set_auth(&mut self, auth: AuthOption) {
        self.auth = Some(auth);
        self.order.touch(OPTION_AUTH);
    }
}

impl OptionPack for LcpOptions {
    const PROTOCOL: u16 = protocol::LCP;
    const NAME: &'static str = "LCP";

    fn read_known(&mut self, kind: u8, mut data: Bytes) -> Result<bool, ParseError> {
        match kind {
            OPTION_MRU => {
                expect_len(&data, 2, UNIT)?;
                self.mru = Some(data.get_u16());
            }
            OPTION_AUTH => {
                if data.len() != 2 && data.len() != 3 {
                    return Err(ParseError::LengthMismatch {
                        unit: UNIT,
                        declared: data.len() + 2,
                        actual: 4,
                    });
                }
                let protocol = data.get_u16();
                let algorithm = data.has_remaining().then(|| data.get_u8());
                self.auth = Some(AuthOption {
                    protocol,
                    algorithm,
                });
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn known_length(&self, kind: u8) -> usize {
        match kind {
            OPTION_MRU => self.mru.map_or(0, |_| 4),
            OPTION_AUTH => self.auth.map_or(0, |auth| 2 + auth.data_len()),
            _ => 0,
        }
    }

    fn write_known(&self, kind: u8, buf: &mut BytesMut) {
        match kind {
            OPTION_MRU => {
                if let Some(mru) = self.mru {
                    put_option_header(buf, OPTION_MRU, 2);
                    buf.put_u16(mru);
                }
            }
            OPTION_AUTH => {
                if let Some(auth) = self.auth {
                    put_option_header(buf, OPTION_AUTH, auth.data_len());
                    buf.put_u16(auth.protocol);
                    if let Some(algorithm) = auth.algorithm {
                        buf.put_u8(algorithm);
                    }
                }
            }
            _ => {}
        }
    }

    fn clear_known(&mut self, kind: u8) {
        match kind {
            OPTION_MRU => self.mru = None,
            OPTION_AUTH => self.auth = None,
            _ => {}
        }
    }

    fn order(&self) -> &OptionOrder {
        &self.order
    }

    fn order_mut(&mut self) -> &mut OptionOrder {
        &mut self.order
    }

    fn unknown(&self) -> &[UnknownOption] {
        &self.unknown
    }

    fn unknown_mut(&mut self) -> &mut Vec<UnknownOption> {
        &mut self.unknown
    }
}
