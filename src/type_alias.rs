//! Type aliases used in this library.

/// [`u32`] (31 bits valid): message tag pairing a request with its response.
pub type Tag = u32;

/// [`u32`]: registered function identifier, derived from the function name.
pub type FnId = u32;

/// [`u64`]: transport-opaque descriptor of a registered memory region.
pub type RmaDesc = u64;

/// [`u64`]: token pairing a posted send with its completion event.
pub type SendToken = u64;
