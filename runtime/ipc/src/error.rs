//! Error taxonomy for the IPC transport
//!
//! Three kinds reach the calling thread, all synchronous and local:
//! - malformed descriptor: rejected before anything is copied
//! - memory fault: extended copy could not page in a buffer page
//! - sequencing fault: no cooperating party is waiting for this IPC
//!
//! None of them is retried here; retry policy belongs to the caller.

use thiserror::Error;

use crate::fault::Direction;
use crate::flags::ErrorCode;
use crate::registers::Word;

/// Flags word describes an impossible or oversized transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("more than one transfer type set (type bits {bits:#x})")]
    MultipleTypes { bits: u32 },

    #[error("unknown transfer type bits {bits:#x}")]
    UnknownType { bits: u32 },

    #[error("size or buffer index set on a {kind} transfer")]
    UnusedField { kind: &'static str },

    #[error("payload of {size} bytes exceeds maximum of {max}")]
    Oversize { size: usize, max: usize },

    #[error("buffer index {index} is not a primary message register")]
    BadIndex { index: usize },

    #[error("payload of {size} bytes exceeds receiver buffer of {capacity}")]
    ReceiverTooSmall { size: usize, capacity: usize },

    #[error("buffer at {address:#x} with {size} bytes wraps the address space")]
    AddressWrap { address: Word, size: usize },
}

/// Failure reported by the virtual-memory collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PagerError {
    #[error("no mapping for address {address:#x}")]
    InvalidAddress { address: Word },

    #[error("access to {address:#x} not permitted")]
    PermissionDenied { address: Word },

    #[error("page {page:#x} faulted again after being resolved")]
    AlreadyResolved { page: Word },

    #[error("page resolution budget for this transfer exhausted")]
    Exhausted,
}

/// Outcome of a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("malformed IPC descriptor: {0}")]
    Malformed(#[from] DescriptorError),

    #[error("memory fault at {address:#x} ({direction}): {cause}")]
    MemoryFault {
        address: Word,
        direction: Direction,
        cause: PagerError,
    },

    #[error("no matching IPC in flight")]
    NoIpc,
}

impl IpcError {
    /// Error nibble reported in the flags word
    pub const fn code(&self) -> ErrorCode {
        match self {
            IpcError::Malformed(_) => ErrorCode::Invalid,
            IpcError::MemoryFault { .. } => ErrorCode::Fault,
            IpcError::NoIpc => ErrorCode::NoIpc,
        }
    }
}

pub type Result<T> = core::result::Result<T, IpcError>;
