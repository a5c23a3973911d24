//! Collector error kinds and the user error hook.

use thiserror::Error;

/// Everything the collector can fail with.
///
/// Fatal kinds abort the process after the registered hook runs; the
/// rest surface as `Err` or as a null allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Pointer or float width is not 64 bits. Init only.
    #[error("64-bit pointers and floats are required")]
    UnsupportedPlatform,
    /// Reserving the heap window or the mark stack failed. Init only.
    #[error("virtual address reservation failed")]
    ReserveFailed,
    /// The stack segment could not be located. Init only.
    #[error("stack segment probe failed")]
    StackProbeFailed,
    /// Committing pages at the bump frontier failed.
    #[error("page commit failed")]
    CommitFailed,
    /// A region's bump pointer reached the end of its address slice.
    #[error("size class out of region space")]
    OutOfRegionSpace,
    /// The requested size exceeds the largest huge class.
    #[error("request exceeds the largest size class")]
    HugeSizeOverflow,
    /// A static root larger than the accepted maximum.
    #[error("root range too large")]
    RootTooLarge,
    /// A mark bitmap could not be reserved mid-collection.
    #[error("mark bitmap reservation failed")]
    MarkMemoryFailed,
}

impl Error {
    /// Fatal errors abort once the user hook returns.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Error::ReserveFailed | Error::HugeSizeOverflow | Error::MarkMemoryFailed
        )
    }
}

/// Hook invoked on every collector error, fatal or not.
///
/// The hook runs inside the collector and must not call back into it.
pub type ErrorHook = fn();
