//! The contract shared by every wire-format entity

use crate::error::ParseError;
use bytes::{Buf, Bytes, BytesMut};

/// A unit with a computed wire length, a decoder and an encoder.
///
/// `decode` consumes exactly `length()` bytes of the decoded value from the
/// front of `buf`; `encode` appends exactly `length()` bytes.
pub trait WireUnit: Sized {
    fn length(&self) -> usize;

    fn decode(buf: &mut Bytes) -> Result<Self, ParseError>;

    fn encode(&self, buf: &mut BytesMut);

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.length());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Fails unless `buf` holds at least `needed` more bytes
pub(crate) fn ensure(buf: &Bytes, needed: usize, unit: &'static str) -> Result<(), ParseError> {
    if buf.remaining() < needed {
        return Err(ParseError::Truncated {
            unit,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Reads a 16-bit declared length and checks it covers at least `header`
pub(crate) fn declared_length(
    buf: &mut Bytes,
    header: usize,
    unit: &'static str,
) -> Result<usize, ParseError> {
    let declared = buf.get_u16() as usize;
    if declared < header {
        return Err(ParseError::InvalidField {
            unit,
            field: "length",
            value: declared as u32,
        });
    }
    Ok(declared)
}

/// Reads an 8-bit length-prefixed field
pub(crate) fn length_prefixed(buf: &mut Bytes, unit: &'static str) -> Result<Bytes, ParseError> {
    ensure(buf, 1, unit)?;
    let len = buf.get_u8() as usize;
    ensure(buf, len, unit)?;
    Ok(buf.split_to(len))
}

/// Fails if `body` was not consumed completely
pub(crate) fn finished(body: &Bytes, declared: usize, unit: &'static str) -> Result<(), ParseError> {
    if body.has_remaining() {
        return Err(ParseError::LengthMismatch {
            unit,
            declared,
            actual: declared - body.remaining(),
        });
    }
    Ok(())
}
