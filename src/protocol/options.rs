//! PPP configuration options and ordered option packs
//!
//! A pack keeps its known options in named fields and everything else as
//! [`UnknownOption`]s. [`OptionOrder`] keeps one slot per option, so a
//! decoded pack encodes back to the peer's exact bytes and a
//! read/modify/write cycle keeps positions, with new types appended.

use super::unit::{ensure, WireUnit};
use crate::error::ParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Debug;

pub const OPTION_HEADER_LEN: usize = 2;
const OPTION_UNIT: &str = "PPP option";

/// An option type the pack does not understand, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOption {
    pub kind: u8,
    pub data: Bytes,
}

impl WireUnit for UnknownOption {
    fn length(&self) -> usize {
        OPTION_HEADER_LEN + self.data.len()
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        let (kind, data) = read_option(buf)?;
        Ok(Self { kind, data })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_option_header(buf, self.kind, self.data.len());
        buf.put_slice(&self.data);
    }
}

/// Splits one option (type, payload) off the front of `buf`
pub(crate) fn read_option(buf: &mut Bytes) -> Result<(u8, Bytes), ParseError> {
    ensure(buf, OPTION_HEADER_LEN, OPTION_UNIT)?;
    let kind = buf.get_u8();
    let len = buf.get_u8() as usize;
    if len < OPTION_HEADER_LEN {
        return Err(ParseError::InvalidField {
            unit: OPTION_UNIT,
            field: "length",
            value: len as u32,
        });
    }
    ensure(buf, len - OPTION_HEADER_LEN, OPTION_UNIT)?;
    Ok((kind, buf.split_to(len - OPTION_HEADER_LEN)))
}

pub(crate) fn put_option_header(buf: &mut BytesMut, kind: u8, data_len: usize) {
    buf.put_u8(kind);
    buf.put_u8((OPTION_HEADER_LEN + data_len) as u8);
}

/// Checks a known option's payload has the fixed size it must have
pub(crate) fn expect_len(data: &Bytes, expected: usize, unit: &'static str) -> Result<(), ParseError> {
    if data.len() != expected {
        return Err(ParseError::LengthMismatch {
            unit,
            declared: data.len() + OPTION_HEADER_LEN,
            actual: expected + OPTION_HEADER_LEN,
        });
    }
    Ok(())
}

/// Wire position of one option: either the pack's known value of `kind` or
/// the next verbatim option of that type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    kind: u8,
    known: bool,
}

/// Order of the options in a pack, one slot per option on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionOrder(Vec<Slot>);

impl OptionOrder {
    /// Gives the known value of `kind` a position unless it already has one
    pub fn touch(&mut self, kind: u8) {
        if !self.has_known(kind) {
            self.0.push(Slot { kind, known: true });
        }
    }

    fn push_verbatim(&mut self, kind: u8) {
        self.0.push(Slot { kind, known: false });
    }

    fn has_known(&self, kind: u8) -> bool {
        self.0.iter().any(|slot| slot.known && slot.kind == kind)
    }

    /// Drops every position of `kind`
    pub fn forget(&mut self, kind: u8) {
        self.0.retain(|slot| slot.kind != kind);
    }

    fn forget_known(&mut self, kind: u8) {
        self.0.retain(|slot| !(slot.known && slot.kind == kind));
    }

    /// Distinct option types in first-seen order
    pub fn kinds(&self) -> Vec<u8> {
        let mut kinds = Vec::with_capacity(self.0.len());
        for slot in &self.0 {
            if !kinds.contains(&slot.kind) {
                kinds.push(slot.kind);
            }
        }
        kinds
    }

    fn known_kinds(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().filter(|slot| slot.known).map(|slot| slot.kind)
    }
}

/// The option set of one control protocol's Configure frames.
pub trait OptionPack: Debug + Clone + Default + PartialEq + Send + Sync + 'static {
    /// PPP protocol number of the frames carrying this pack
    const PROTOCOL: u16;
    const NAME: &'static str;

    /// Stores a known option; returns `false` for types this pack doesn't know
    fn read_known(&mut self, kind: u8, data: Bytes) -> Result<bool, ParseError>;

    /// Wire length of the known option `kind`, 0 when absent
    fn known_length(&self, kind: u8) -> usize;

    /// Appends the known option `kind` if present
    fn write_known(&self, kind: u8, buf: &mut BytesMut);

    fn clear_known(&mut self, kind: u8);

    fn order(&self) -> &OptionOrder;
    fn order_mut(&mut self) -> &mut OptionOrder;
    fn unknown(&self) -> &[UnknownOption];
    fn unknown_mut(&mut self) -> &mut Vec<UnknownOption>;

    fn pack_length(&self) -> usize {
        self.order()
            .known_kinds()
            .map(|kind| self.known_length(kind))
            .sum::<usize>()
            + self.unknown().iter().map(|o| o.length()).sum::<usize>()
    }

    /// Reads options until `body` is exhausted. A repeated known type is kept
    /// verbatim alongside the unknown options.
    fn decode_pack(mut body: Bytes) -> Result<Self, ParseError> {
        let mut pack = Self::default();
        while body.has_remaining() {
            let (kind, data) = read_option(&mut body)?;
            if !pack.order().has_known(kind) && pack.read_known(kind, data.clone())? {
                pack.order_mut().touch(kind);
            } else {
                pack.order_mut().push_verbatim(kind);
                pack.unknown_mut().push(UnknownOption { kind, data });
            }
        }
        Ok(pack)
    }

    /// Writes the options in slot order, so a decoded pack encodes to the
    /// bytes it came from
    fn encode_pack(&self, buf: &mut BytesMut) {
        let mut written = vec![false; self.unknown().len()];
        for slot in &self.order().0 {
            if slot.known {
                self.write_known(slot.kind, buf);
                continue;
            }
            let next = self
                .unknown()
                .iter()
                .enumerate()
                .find(|(i, o)| !written[*i] && o.kind == slot.kind);
            if let Some((i, option)) = next {
                written[i] = true;
                option.encode(buf);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.pack_length() == 0
    }

    fn has_unknown(&self) -> bool {
        !self.unknown().is_empty()
    }

    /// Removes every option of `kind`, known or not
    fn remove(&mut self, kind: u8) {
        self.clear_known(kind);
        self.unknown_mut().retain(|o| o.kind != kind);
        self.order_mut().forget(kind);
    }

    /// A copy holding only the option types in `kinds`, order preserved
    fn subset(&self, kinds: &[u8]) -> Self {
        let mut copy = self.clone();
        for kind in self.order().kinds() {
            if !kinds.contains(&kind) {
                copy.remove(kind);
            }
        }
        copy
    }

    /// A copy holding only the verbatim options, for a Configure-Reject
    fn unknown_only(&self) -> Self {
        let mut copy = self.clone();
        for kind in self.order().known_kinds() {
            copy.clear_known(kind);
            copy.order_mut().forget_known(kind);
        }
        copy
    }
}
