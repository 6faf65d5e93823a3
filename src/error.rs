//! Error type shared by both engines.
//!
//! Only allocation can fail. Everything that merely relinks live nodes
//! (erase, rotations, rehash relinking) is infallible and does not return
//! `Result`.

use core::fmt;
use std::collections::TryReserveError;

use crate::alloc::AllocError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The node allocator refused to store another node.
    Alloc(AllocError),
    /// The bucket array (or the scratch space of a bulk insert) could not be
    /// allocated.
    BucketAlloc(TryReserveError),
    /// The requested bucket count is larger than the biggest tabulated prime.
    CapacityOverflow,
    /// Max load factor must be finite and strictly positive.
    InvalidLoadFactor,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Alloc(e) => write!(f, "node allocation failed: {e}"),
            Error::BucketAlloc(e) => write!(f, "bucket array allocation failed: {e}"),
            Error::CapacityOverflow => f.write_str("bucket count exceeds the prime table"),
            Error::InvalidLoadFactor => {
                f.write_str("max load factor must be finite and greater than zero")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Alloc(e) => Some(e),
            Error::BucketAlloc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Error::Alloc(e)
    }
}

impl From<TryReserveError> for Error {
    fn from(e: TryReserveError) -> Self {
        Error::BucketAlloc(e)
    }
}
