//! On-the-wire framing and header layouts.

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use crate::error::{Error, Result};
use crate::mem::MemHandle;
use crate::type_alias::*;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            #[inline(always)]
            pub fn [< set_ $field >](&mut self, val: $field_ty) {
                self.bits[$lsb..=$msb].store_le::<$integral_ty>(val as $integral_ty);
            }

            #[inline(always)]
            pub fn $field(&self) -> $field_ty {
                self.bits[$lsb..=$msb].load_le::<$integral_ty>() as $field_ty
            }
        }
    };
}

/// Size of the framing word prefixed to every two-sided message.
pub const FRAME_BYTES: usize = 4;

/// Framing word, 4 bytes.
///
/// # Layout
///
/// | Lsb | Msb |  Name  |
/// | --: | --: | ------ |
/// |   0 |   0 | expect |
/// |   1 |  31 | tag    |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FrameHeader {
    bits: bv::BitArr!(for 32, in u8),
}

impl FrameHeader {
    impl_accessor!(tag, Tag, u32, 1, 31);

    pub fn new(expect: bool, tag: Tag) -> Self {
        let mut this = Self {
            bits: bv::BitArray::ZERO,
        };
        this.set_expect(expect);
        this.set_tag(tag);
        this
    }

    #[inline(always)]
    pub fn set_expect(&mut self, val: bool) {
        self.bits.set(0, val);
    }

    #[inline(always)]
    pub fn expect(&self) -> bool {
        self.bits[0]
    }

    #[inline(always)]
    pub fn to_bytes(self) -> [u8; FRAME_BYTES] {
        self.bits.into_inner()
    }

    #[inline(always)]
    pub fn from_bytes(bytes: [u8; FRAME_BYTES]) -> Self {
        Self {
            bits: bv::BitArray::new(bytes),
        }
    }
}

/// Magic word identifying request/response headers.
pub const PROTOCOL_MAGIC: u32 = 0x4852_5043;

/// Header layout version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the request header written after the framing word.
pub const REQUEST_HEADER_BYTES: usize = 12 + MemHandle::SERIALIZED_LEN;

/// Size of the response header.
pub const RESPONSE_HEADER_BYTES: usize = 12;

const FLAG_EXTRA_BUF: u8 = 1;

fn header_checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0x811c_9dc5u32, |h, b| (h ^ *b as u32).wrapping_mul(0x0100_0193))
}

/// Fixed-layout request header: call identifier plus the optional handle of
/// an oversize-input side buffer. A zeroed handle image with the flag bit
/// clear is the no-extra-buffer sentinel.
///
/// # Layout (little-endian)
///
/// | Offset | Size | Field        |
/// | -----: | ---: | ------------ |
/// |      0 |    4 | magic        |
/// |      4 |    1 | version      |
/// |      5 |    1 | flags        |
/// |      6 |    2 | reserved     |
/// |      8 |    4 | call id      |
/// |     12 |   26 | handle image |
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub id: FnId,
    pub extra: Option<MemHandle>,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < REQUEST_HEADER_BYTES {
            return Err(Error::Size);
        }
        buf[0..4].copy_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = if self.extra.is_some() { FLAG_EXTRA_BUF } else { 0 };
        buf[6..8].fill(0);
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        match &self.extra {
            Some(handle) => handle.serialize(&mut buf[12..REQUEST_HEADER_BYTES])?,
            None => buf[12..REQUEST_HEADER_BYTES].fill(0),
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQUEST_HEADER_BYTES {
            return Err(Error::Size);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != PROTOCOL_MAGIC || buf[4] != PROTOCOL_VERSION {
            return Err(Error::Protocol);
        }
        let id = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let extra = if buf[5] & FLAG_EXTRA_BUF != 0 {
            Some(MemHandle::deserialize(&buf[12..REQUEST_HEADER_BYTES])?)
        } else {
            None
        };
        Ok(Self { id, extra })
    }
}

/// Fixed-layout response header: status byte plus a checksum word over the
/// preceding fields.
///
/// # Layout (little-endian)
///
/// | Offset | Size | Field    |
/// | -----: | ---: | -------- |
/// |      0 |    4 | magic    |
/// |      4 |    1 | version  |
/// |      5 |    1 | status   |
/// |      6 |    2 | reserved |
/// |      8 |    4 | checksum |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: u8,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < RESPONSE_HEADER_BYTES {
            return Err(Error::Size);
        }
        buf[0..4].copy_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.status;
        buf[6..8].fill(0);
        let sum = header_checksum(&buf[0..8]);
        buf[8..12].copy_from_slice(&sum.to_le_bytes());
        Ok(())
    }

    /// Decode and verify. Any mismatch in magic, version or checksum fails
    /// verification.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RESPONSE_HEADER_BYTES {
            return Err(Error::Checksum);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let sum = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if magic != PROTOCOL_MAGIC || buf[4] != PROTOCOL_VERSION || sum != header_checksum(&buf[0..8])
        {
            return Err(Error::Checksum);
        }
        Ok(Self { status: buf[5] })
    }
}
