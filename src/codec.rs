//! Value serialization over caller-provided buffers.
//!
//! A [`Proc`] walks a user codec over a buffer in one of three modes:
//! encoding a value into the buffer, decoding the buffer back into a value,
//! or releasing whatever the decode mode allocated inside the value. The
//! same codec function serves all three modes by switching on [`Proc::op`].

use std::any::Any;
use std::sync::Arc;

use crate::error::{Error, Result};

/// What a codec invocation is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcOp {
    /// Serialize the value into the buffer.
    Encode,
    /// Reconstruct the value from the buffer.
    Decode,
    /// Release dynamically allocated members of the value.
    Free,
}

/// User codec routine. One routine usually handles all three [`ProcOp`]
/// modes for a given type.
pub type ProcFn = Arc<dyn Fn(&mut Proc<'_>, &mut dyn Any) -> Result<()> + Send + Sync>;

/// Cursor over an encode/decode buffer.
///
/// Encoding that outgrows the primary buffer transparently spills into an
/// owned overflow buffer holding the entire encoding; the caller can take
/// it with [`Proc::take_extra`] after the codec has run.
pub struct Proc<'a> {
    op: ProcOp,
    buf: &'a mut [u8],
    pos: usize,
    extra: Option<Vec<u8>>,
}

impl<'a> Proc<'a> {
    /// Open an encoder over `buf`.
    pub fn encode(buf: &'a mut [u8]) -> Self {
        Self {
            op: ProcOp::Encode,
            buf,
            pos: 0,
            extra: None,
        }
    }

    /// Open a decoder over `buf`.
    pub fn decode(buf: &'a mut [u8]) -> Self {
        Self {
            op: ProcOp::Decode,
            buf,
            pos: 0,
            extra: None,
        }
    }

    /// Open a release-mode proc. No buffer is involved.
    pub fn free() -> Proc<'static> {
        Proc {
            op: ProcOp::Free,
            buf: &mut [],
            pos: 0,
            extra: None,
        }
    }

    /// The mode this proc runs in.
    #[inline(always)]
    pub fn op(&self) -> ProcOp {
        self.op
    }

    /// Total number of bytes processed so far.
    #[inline]
    pub fn size(&self) -> usize {
        match &self.extra {
            Some(v) => v.len(),
            None => self.pos,
        }
    }

    /// Take ownership of the overflow buffer, if encoding spilled past the
    /// primary buffer. The overflow buffer holds the entire encoding.
    pub fn take_extra(&mut self) -> Option<Vec<u8>> {
        self.extra.take()
    }

    fn write(&mut self, src: &[u8]) {
        if let Some(v) = self.extra.as_mut() {
            v.extend_from_slice(src);
            return;
        }
        if self.pos + src.len() <= self.buf.len() {
            self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
            self.pos += src.len();
        } else {
            // Outgrew the primary buffer: move what is already encoded into
            // an owned buffer and continue there.
            let mut v = Vec::with_capacity((self.pos + src.len()).max(self.buf.len() * 2));
            v.extend_from_slice(&self.buf[..self.pos]);
            v.extend_from_slice(src);
            self.extra = Some(v);
        }
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.pos + dst.len() > self.buf.len() {
            return Err(Error::Size);
        }
        dst.copy_from_slice(&self.buf[self.pos..self.pos + dst.len()]);
        self.pos += dst.len();
        Ok(())
    }

    /// Process a raw byte run.
    pub fn raw(&mut self, bytes: &mut [u8]) -> Result<()> {
        match self.op {
            ProcOp::Encode => {
                self.write(bytes);
                Ok(())
            }
            ProcOp::Decode => self.read(bytes),
            ProcOp::Free => Ok(()),
        }
    }

    /// Process a `u8`.
    pub fn u8(&mut self, value: &mut u8) -> Result<()> {
        let mut b = [*value];
        self.raw(&mut b)?;
        *value = b[0];
        Ok(())
    }

    /// Process a `u32`.
    pub fn u32(&mut self, value: &mut u32) -> Result<()> {
        let mut b = value.to_le_bytes();
        self.raw(&mut b)?;
        *value = u32::from_le_bytes(b);
        Ok(())
    }

    /// Process a `u64`.
    pub fn u64(&mut self, value: &mut u64) -> Result<()> {
        let mut b = value.to_le_bytes();
        self.raw(&mut b)?;
        *value = u64::from_le_bytes(b);
        Ok(())
    }

    /// Process a length-prefixed byte vector.
    pub fn bytes(&mut self, value: &mut Vec<u8>) -> Result<()> {
        match self.op {
            ProcOp::Encode => {
                let mut len = value.len() as u64;
                self.u64(&mut len)?;
                self.write(value);
                Ok(())
            }
            ProcOp::Decode => {
                let mut len = 0u64;
                self.u64(&mut len)?;
                if self.pos as u64 + len > self.buf.len() as u64 {
                    return Err(Error::Size);
                }
                value.resize(len as usize, 0);
                self.read(&mut value[..])
            }
            ProcOp::Free => {
                *value = Vec::new();
                Ok(())
            }
        }
    }

    /// Process a length-prefixed UTF-8 string.
    pub fn string(&mut self, value: &mut String) -> Result<()> {
        match self.op {
            ProcOp::Encode => {
                let mut len = value.len() as u64;
                self.u64(&mut len)?;
                self.write(value.as_bytes());
                Ok(())
            }
            ProcOp::Decode => {
                let mut bytes = Vec::new();
                self.bytes(&mut bytes)?;
                *value = String::from_utf8(bytes).map_err(|_| Error::Protocol)?;
                Ok(())
            }
            ProcOp::Free => {
                *value = String::new();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut buf = [0u8; 64];

        let mut enc = Proc::encode(&mut buf);
        let mut a = 0x1234_5678u32;
        let mut b = 0xdead_beef_cafe_f00du64;
        enc.u32(&mut a).unwrap();
        enc.u64(&mut b).unwrap();
        assert_eq!(enc.size(), 12);
        assert!(enc.take_extra().is_none());

        let mut dec = Proc::decode(&mut buf);
        let (mut a2, mut b2) = (0u32, 0u64);
        dec.u32(&mut a2).unwrap();
        dec.u64(&mut b2).unwrap();
        assert_eq!(a2, 0x1234_5678);
        assert_eq!(b2, 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = [0u8; 64];

        let mut enc = Proc::encode(&mut buf);
        let mut s = String::from("hello");
        enc.string(&mut s).unwrap();
        assert_eq!(enc.size(), 8 + 5);

        let mut dec = Proc::decode(&mut buf);
        let mut out = String::new();
        dec.string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_overflow_spills_whole_encoding() {
        let mut buf = [0u8; 16];

        let mut enc = Proc::encode(&mut buf);
        let mut s = "x".repeat(100);
        enc.string(&mut s).unwrap();
        assert_eq!(enc.size(), 108);

        let extra = enc.take_extra().expect("encoding should have spilled");
        assert_eq!(extra.len(), 108);
        assert_eq!(u64::from_le_bytes(extra[0..8].try_into().unwrap()), 100);
        assert!(extra[8..].iter().all(|b| *b == b'x'));
    }

    #[test]
    fn test_decode_past_end() {
        let mut buf = [0u8; 4];
        let mut dec = Proc::decode(&mut buf);
        let mut v = 0u64;
        assert_eq!(dec.u64(&mut v), Err(Error::Size));
    }

    #[test]
    fn test_free_mode_clears() {
        let mut p = Proc::free();
        let mut s = String::from("leftover");
        p.string(&mut s).unwrap();
        assert!(s.is_empty());
    }
}
