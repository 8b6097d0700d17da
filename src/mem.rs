use crate::error::{Error, Result};
use crate::type_alias::RmaDesc;

/// Access rights requested for a registered memory region.
///
/// Registration always grants local read; `ReadWrite` additionally allows
/// remote writes (`put`) into the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemAccess {
    ReadOnly = 0,
    ReadWrite = 1,
}

impl TryFrom<u8> for MemAccess {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MemAccess::ReadOnly),
            1 => Ok(MemAccess::ReadWrite),
            _ => Err(Error::Protocol),
        }
    }
}

/// Handle over a contiguous memory region usable as a one-sided transfer
/// source or target.
///
/// A handle starts out as a plain shell; it must be registered with the
/// endpoint before any `put`/`get` references it. The serialized form is a
/// fixed-size byte image that peers can copy verbatim.
#[derive(Debug, Clone)]
pub struct MemHandle {
    base: u64,
    len: u64,
    access: MemAccess,
    desc: Option<RmaDesc>,
}

impl MemHandle {
    /// Byte length of the serialized handle image.
    pub const SERIALIZED_LEN: usize = 26;

    /// Create an unregistered handle shell over `[base, base + len)`.
    pub fn new(base: *mut u8, len: usize, access: MemAccess) -> Self {
        Self {
            base: base as u64,
            len: len as u64,
            access,
            desc: None,
        }
    }

    #[inline(always)]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn access(&self) -> MemAccess {
        self.access
    }

    /// Transport descriptor, present once the handle is registered.
    #[inline(always)]
    pub fn desc(&self) -> Option<RmaDesc> {
        self.desc
    }

    #[inline(always)]
    pub fn is_registered(&self) -> bool {
        self.desc.is_some()
    }

    pub(crate) fn bind(&mut self, desc: RmaDesc) {
        self.desc = Some(desc);
    }

    pub(crate) fn unbind(&mut self) -> Option<RmaDesc> {
        self.desc.take()
    }

    /// Write the fixed-size handle image into `buf`.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::SERIALIZED_LEN {
            return Err(Error::Size);
        }
        buf[0..8].copy_from_slice(&self.base.to_le_bytes());
        buf[8..16].copy_from_slice(&self.len.to_le_bytes());
        buf[16] = self.access as u8;
        buf[17] = self.desc.is_some() as u8;
        buf[18..26].copy_from_slice(&self.desc.unwrap_or(0).to_le_bytes());
        Ok(())
    }

    /// Reconstruct a handle from its fixed-size image.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SERIALIZED_LEN {
            return Err(Error::Size);
        }
        let base = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let len = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let access = MemAccess::try_from(buf[16])?;
        let registered = match buf[17] {
            0 => false,
            1 => true,
            _ => return Err(Error::Protocol),
        };
        let desc = u64::from_le_bytes(buf[18..26].try_into().unwrap());
        Ok(Self {
            base,
            len,
            access,
            desc: registered.then_some(desc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_image_roundtrip() {
        let mut region = [0u8; 64];
        let mut handle = MemHandle::new(region.as_mut_ptr(), region.len(), MemAccess::ReadWrite);
        handle.bind(0xDEAD_BEEF);

        let mut image = [0u8; MemHandle::SERIALIZED_LEN];
        handle.serialize(&mut image).unwrap();
        let back = MemHandle::deserialize(&image).unwrap();

        assert_eq!(back.base(), handle.base());
        assert_eq!(back.len(), 64);
        assert_eq!(back.access(), MemAccess::ReadWrite);
        assert_eq!(back.desc(), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_serialize_too_small() {
        let mut region = [0u8; 8];
        let handle = MemHandle::new(region.as_mut_ptr(), region.len(), MemAccess::ReadOnly);
        let mut image = [0u8; MemHandle::SERIALIZED_LEN - 1];
        assert_eq!(handle.serialize(&mut image), Err(Error::Size));
    }
}
