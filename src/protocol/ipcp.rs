//! IPCP and IPv6CP option packs

use super::options::{expect_len, put_option_header, OptionOrder, OptionPack, UnknownOption};
use super::ppp::protocol;
use crate::error::ParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

pub const OPTION_IP_ADDRESS: u8 = 3;
pub const OPTION_PRIMARY_DNS: u8 = 129;
pub const OPTION_INTERFACE_IDENTIFIER: u8 = 1;

const IPCP_UNIT: &str = "IPCP option";
const IPV6CP_UNIT: &str = "IPv6CP option";

fn read_ipv4(mut data: Bytes, unit: &'static str) -> Result<Ipv4Addr, ParseError> {
    expect_len(&data, 4, unit)?;
    Ok(Ipv4Addr::from(data.get_u32()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcpOptions {
    address: Option<Ipv4Addr>,
    dns: Option<Ipv4Addr>,
    unknown: Vec<UnknownOption>,
    order: OptionOrder,
}

impl IpcpOptions {
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn set_address(&mut self, address: Ipv4Addr) {
        self.address = Some(address);
        self.order.touch(OPTION_IP_ADDRESS);
    }

    pub fn dns(&self) -> Option<Ipv4Addr> {
        self.dns
    }

    pub fn set_dns(&mut self, dns: Ipv4Addr) {
        self.dns = Some(dns);
        self.order.touch(OPTION_PRIMARY_DNS);
    }
}

impl OptionPack for IpcpOptions {
    const PROTOCOL: u16 = protocol::IPCP;
    const NAME: &'static str = "IPCP";

    fn read_known(&mut self, kind: u8, data: Bytes) -> Result<bool, ParseError> {
        match kind {
            OPTION_IP_ADDRESS => self.address = Some(read_ipv4(data, IPCP_UNIT)?),
            OPTION_PRIMARY_DNS => self.dns = Some(read_ipv4(data, IPCP_UNIT)?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn known_length(&self, kind: u8) -> usize {
        let present = match kind {
            OPTION_IP_ADDRESS => self.address.is_some(),
            OPTION_PRIMARY_DNS => self.dns.is_some(),
            _ => false,
        };
        if present {
            6
        } else {
            0
        }
    }

    fn write_known(&self, kind: u8, buf: &mut BytesMut) {
        let value = match kind {
            OPTION_IP_ADDRESS => self.address,
            OPTION_PRIMARY_DNS => self.dns,
            _ => None,
        };
        if let Some(address) = value {
            put_option_header(buf, kind, 4);
            buf.put_slice(&address.octets());
        }
    }

    fn clear_known(&mut self, kind: u8) {
        match kind {
            OPTION_IP_ADDRESS => self.address = None,
            OPTION_PRIMARY_DNS => self.dns = None,
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

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipv6cpOptions {
    identifier: Option<[u8; 8]>,
    unknown: Vec<UnknownOption>,
    order: OptionOrder,
}

impl Ipv6cpOptions {
    pub fn identifier(&self) -> Option<[u8; 8]> {
        self.identifier
    }

    pub fn set_identifier(&mut self, identifier: [u8; 8]) {
        self.identifier = Some(identifier);
        self.order.touch(OPTION_INTERFACE_IDENTIFIER);
    }
}

impl OptionPack for Ipv6cpOptions {
    const PROTOCOL: u16 = protocol::IPV6CP;
    const NAME: &'static str = "IPv6CP";

    fn read_known(&mut self, kind: u8, mut data: Bytes) -> Result<bool, ParseError> {
        if kind != OPTION_INTERFACE_IDENTIFIER {
            return Ok(false);
        }
        expect_len(&data, 8, IPV6CP_UNIT)?;
        let mut identifier = [0; 8];
        data.copy_to_slice(&mut identifier);
        self.identifier = Some(identifier);
        Ok(true)
    }

    fn known_length(&self, kind: u8) -> usize {
        match (kind, self.identifier) {
            (OPTION_INTERFACE_IDENTIFIER, Some(_)) => 10,
            _ => 0,
        }
    }

    fn write_known(&self, kind: u8, buf: &mut BytesMut) {
        if let (OPTION_INTERFACE_IDENTIFIER, Some(identifier)) = (kind, self.identifier) {
            put_option_header(buf, kind, 8);
            buf.put_slice(&identifier);
        }
    }

    fn clear_known(&mut self, kind: u8) {
        if kind == OPTION_INTERFACE_IDENTIFIER {
            self.identifier = None;
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
