/// An owned message buffer with separate valid-length and capacity.
///
/// The capacity is fixed at allocation time. Receive posts hand the whole
/// buffer to the runtime and get it back with `len` set to the number of
/// bytes actually delivered.
pub struct MsgBuf {
    /// Backing storage, fully initialized up to the capacity.
    data: Vec<u8>,

    /// Valid data bytes in the MsgBuf.
    len: usize,
}

impl MsgBuf {
    /// Create a new MsgBuf with the given capacity and zero valid bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0; cap],
            len: 0,
        }
    }

    /// Create a MsgBuf holding a copy of the given bytes, fully valid.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            len: bytes.len(),
        }
    }

    /// Return the length of valid data.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return `true` if there are no valid data bytes.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the capacity of the buffer.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Set the valid data length.
    ///
    /// # Panics
    ///
    /// Panic if `len` is larger than the capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.data.len(),
            "len {} > MsgBuf capacity {}",
            len,
            self.data.len()
        );
        self.len = len;
    }

    /// View the valid data as a `[u8]` slice.
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// View the entire capacity as a mutable `[u8]` slice.
    #[inline(always)]
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Pointer to the first byte of the backing storage.
    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// Copy `src` into the start of the buffer, truncating to capacity,
    /// and set the valid length to the number of bytes copied.
    ///
    /// Returns the copied length.
    pub(crate) fn fill_truncated(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n;
        n
    }
}
