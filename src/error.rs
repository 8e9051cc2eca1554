//! Crate-wide error kinds and their errno-style integer mapping.
//! Library APIs return `Result`; binding layers that need the classic
//! negative integer codes use [`Error::errno`].

use thiserror::Error;

/// Error kinds surfaced by the stream control plane.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad config, bad TLV, unknown vendor UUID, duplicate user id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing engine or capture profile.
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation or resource exhaustion.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Read outside buffering, or engine/device I/O surfaced verbatim.
    #[error("i/o failure: {0}")]
    Io(String),

    /// Operation during subsystem restart from a non-matching saved state.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Engine start failed; caller may retry after cleanup.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl Error {
    /// Map to the negative errno-style code used by the integer client surface.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -22, // -EINVAL
            Error::NotFound(_) => -2,         // -ENOENT
            Error::ResourceExhausted(_) => -12, // -ENOMEM
            Error::Io(_) => -5,               // -EIO
            Error::PreconditionFailed(_) => -22,
            Error::Transient(_) => -5,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
