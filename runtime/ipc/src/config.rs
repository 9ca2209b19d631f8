//! Transport configuration
//!
//! Two layers, mirroring how the kernel composes components:
//! - Build-time: the architecture register map and memory layout constants,
//!   selected with `arch-*` cargo features. These are shared by the kernel
//!   side and the user library and are never mutated at runtime.
//! - Runtime: [`TransferConfig`], a small value handed to the transfer engine
//!   for the one policy the message format leaves open (who owns `MR_SENDER`).

/// Page size used for extended-copy fault resolution (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Size of the per-thread TCB region (UTCB) in bytes
pub const UTCB_SIZE: usize = 256;

/// Largest payload an extended IPC may carry, in bytes
pub const IPC_EXTENDED_MAX_SIZE: usize = 2 * 1024;

#[cfg(all(feature = "arch-arm", feature = "arch-riscv32"))]
compile_error!("Select exactly one register map: 'arch-arm' or 'arch-riscv32'.");

/// Name of the register map compiled in
pub const fn arch_name() -> &'static str {
    if cfg!(feature = "arch-riscv32") {
        "riscv32"
    } else {
        "arm"
    }
}

/// When the kernel overwrites the receiver's `MR_SENDER` slot.
///
/// The slot is an ordinary primary message register; the kernel only
/// claims it to tell a receiver who the sender was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderPolicy {
    /// Only receivers that accepted any thread learn the sender id.
    /// Directed receivers already know it and keep the payload word.
    #[default]
    AnyThreadOnly,
    /// Every receiver gets the sender id.
    Always,
    /// The slot is always left as payload.
    Never,
}

/// Runtime policy for the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferConfig {
    pub sender_policy: SenderPolicy,
}

impl TransferConfig {
    /// Configuration with an explicit sender policy
    pub const fn with_sender_policy(sender_policy: SenderPolicy) -> Self {
        Self { sender_policy }
    }
}
