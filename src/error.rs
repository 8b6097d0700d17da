use thiserror::Error;

/// Operation outcome codes.
///
/// Success is expressed as `Ok(())`; everything else maps onto a stable
/// one-byte code that is also used as the status field of response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("operation failed")]
    Fail,

    #[error("timeout")]
    Timeout,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("size error")]
    Size,

    #[error("out of memory")]
    NoMem,

    #[error("protocol error")]
    Protocol,

    #[error("no match found")]
    NoMatch,

    #[error("checksum error")]
    Checksum,

    #[error("permission error")]
    Permission,
}

impl Error {
    /// Wire code of this error. Zero is reserved for success.
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            Error::Fail => 1,
            Error::Timeout => 2,
            Error::InvalidParam => 3,
            Error::Size => 4,
            Error::NoMem => 5,
            Error::Protocol => 6,
            Error::NoMatch => 7,
            Error::Checksum => 8,
            Error::Permission => 9,
        }
    }

    /// Map a wire code back to an outcome. Zero means success.
    pub fn from_code(code: u8) -> Result<()> {
        match code {
            0 => Ok(()),
            1 => Err(Error::Fail),
            2 => Err(Error::Timeout),
            3 => Err(Error::InvalidParam),
            4 => Err(Error::Size),
            5 => Err(Error::NoMem),
            6 => Err(Error::Protocol),
            7 => Err(Error::NoMatch),
            8 => Err(Error::Checksum),
            9 => Err(Error::Permission),
            _ => Err(Error::Protocol),
        }
    }

    /// Stable human-readable name of this error.
    pub fn as_str(self) -> &'static str {
        match self {
            Error::Fail => "FAIL",
            Error::Timeout => "TIMEOUT",
            Error::InvalidParam => "INVALID_PARAM",
            Error::Size => "SIZE_ERROR",
            Error::NoMem => "NOMEM_ERROR",
            Error::Protocol => "PROTOCOL_ERROR",
            Error::NoMatch => "NO_MATCH",
            Error::Checksum => "CHECKSUM_ERROR",
            Error::Permission => "PERMISSION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
