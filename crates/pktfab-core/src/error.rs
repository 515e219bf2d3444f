//! Control-plane error codes.
//!
//! The receive path never returns these — anomalies there become counter
//! increments and per-frame skips. Only the control path (join/leave,
//! filter/program installation, socket open) reports definite errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FabricError {
    /// Out-of-range group id, socket id, class or device argument.
    #[error("invalid argument")]
    InvalidArgument,

    /// The group policy forbids this operation for the caller.
    #[error("operation not permitted")]
    NotPermitted,

    /// The operation is reserved to the group owner.
    #[error("permission denied: not the group owner")]
    NotOwner,

    /// No free group or socket slot available.
    #[error("resource busy: no free slot")]
    Busy,

    /// Allocation failure on the control path.
    #[error("out of memory")]
    OutOfMemory,

    /// A configuration parameter failed init-time validation.
    #[error("bad configuration: {0}")]
    BadConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, FabricError>;
