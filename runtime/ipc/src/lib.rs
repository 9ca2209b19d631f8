//! KaaL IPC - Synchronous message transport between threads
//!
//! # Purpose
//! Moves a message from a sending thread to a receiving thread once the two
//! have rendezvoused. Short messages travel in registers, full messages also
//! copy the secondary message registers of the TCB region (UTCB), and
//! extended messages copy up to 2KB between user buffers that may need to be
//! paged in.
//!
//! # Integration Points
//! - Depends on: a scheduler that pairs sender and receiver, a pager
//!   implementing [`VirtualMemory`]
//! - Provides to: kernel IPC syscalls (send/receive/call/reply) and the user
//!   IPC library (shared register map, UTCB layout and flags format)
//! - Architectures: ARM (default) or RISC-V 32 register maps via features
//!
//! # Architecture
//! ```text
//!  registers ── RegisterRoleMap: syscall roles ↔ physical slots
//!  utcb      ── Utcb: primary mirror, nested save, secondary MRs
//!  flags     ── IpcType / ErrorCode ↔ 32-bit flags word
//!  transfer  ── TransferEngine: short / full / extended
//!  fault     ── FaultHandler: one page per resolution, both directions
//! ```
//!
//! # Design
//! - Everything is `no_std` and allocation-free; the extended staging buffer
//!   lives inside the engine
//! - All-or-nothing delivery: the receiver never observes a partial message
//! - Errors are returned to the sender in `MR_RETURN` and the flags error
//!   nibble; nothing is retried

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(any(test, feature = "mock"))]
extern crate alloc;

pub mod config;
pub mod error;
pub mod fault;
pub mod flags;
pub mod registers;
pub mod tcb;
pub mod transfer;
pub mod utcb;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{SenderPolicy, TransferConfig, IPC_EXTENDED_MAX_SIZE, PAGE_SIZE, UTCB_SIZE};
pub use error::{DescriptorError, IpcError, PagerError, Result};
pub use fault::{Direction, FaultHandler, NotResident, Resolution, VirtualMemory};
pub use flags::{ErrorCode, Extended, IpcType, UserCode};
pub use registers::{RegisterFile, RegisterRoleMap, SyscallRegisters, Word, MR_RETURN, MR_SENDER, MR_TAG, MR_TOTAL};
pub use tcb::{RecvFrom, Tcb, ThreadId, ThreadState, ANYTHREAD};
pub use transfer::{Completion, IpcPhase, TransferEngine, TransferOutcome};
pub use utcb::{Utcb, MR_REST, UTCB_FULL_BUFFER_SIZE};
