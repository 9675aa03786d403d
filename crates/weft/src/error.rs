use thiserror::Error;
use weft_utils::alloc::AllocError;

/// Failures surfaced at the core boundary.
///
/// Programming errors (mutating a locked message, a double buffer borrow,
/// leaking a reservation) are not represented here; those go through
/// `weft_utils::bug!` and terminate debug builds.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("out of memory")]
    NoMemory,
    #[error("buffer growth would overflow")]
    Overflow,
    #[error("peer is disconnected")]
    Disconnected,
    #[error("message stream is corrupted")]
    Corrupted,
}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Self::NoMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Well-known error names carried on the wire, reverse-DNS style.
pub mod names {
    /// Reply name used when the bus itself ran out of memory.
    pub const NO_MEMORY: &str = "dev.weft.Error.NoMemory";
    /// Reply name used when the addressed peer is gone.
    pub const DISCONNECTED: &str = "dev.weft.Error.Disconnected";
}
