//! Register-Role Map
//!
//! Assigns the slots of a thread's saved register file to three roles:
//!
//! - **System registers** (3): read by the kernel on every `ipc()` call.
//!   Slot 0 is the destination, slot 1 the source, slot 2 the flags word.
//! - **Primary message registers** MR0-MR5 (6): opaque payload, copied on
//!   every IPC and mirrored in the UTCB.
//! - **Reserved meanings** layered over the primaries by convention:
//!   `MR_TAG`/`MR_RETURN` share MR0, `MR_SENDER` is MR1.
//!
//! ## ARM map
//!
//! ```text
//! r0    System register      destination
//! r1    System register      source
//! r2    System register      flags
//! r3    Primary MR0          MR_RETURN, MR_TAG
//! r4    Primary MR1          MR_SENDER
//! r5-r8 Primary MR2-MR5      syscall arguments 0-3
//! ```
//!
//! The map is a build-time constant; the engine only ever reaches registers
//! through [`SyscallRegisters`], so it never hard-codes register names.

use core::fmt;
use static_assertions::const_assert;

/// Machine word carried by a message register
pub type Word = u32;

/// Size of a message register in bytes
pub const WORD_SIZE: usize = core::mem::size_of::<Word>();

/// Number of kernel-interpreted system registers
pub const SYSTEM_REGS: usize = 3;

/// Number of primary message registers (backed by real registers)
pub const MR_TOTAL: usize = 6;

/// Contains the purpose of the message
pub const MR_TAG: usize = 0;
/// For anythread receivers to discover the sender
pub const MR_SENDER: usize = 1;
/// Contains the return value on completion
pub const MR_RETURN: usize = 0;

/// First MR not claimed by the user syscall library
pub const MR_UNUSED_START: usize = 2;
/// Number of MRs left for syscall arguments
pub const MR_UNUSED_TOTAL: usize = MR_TOTAL - MR_UNUSED_START;
/// Alias used by the user syscall library
pub const MR_USABLE_TOTAL: usize = MR_UNUSED_TOTAL;

/// System register holding the destination thread
pub const SYS_DEST: usize = 0;
/// System register holding the expected source thread
pub const SYS_SOURCE: usize = 1;
/// System register holding the IPC flags word
pub const SYS_FLAGS: usize = 2;

/// Static assignment of register-file slots to IPC roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRoleMap {
    /// Total number of slots in the saved register file
    pub file_len: usize,
    /// Slots backing the system registers
    pub system: [usize; SYSTEM_REGS],
    /// Slots backing MR0-MR5
    pub primary: [usize; MR_TOTAL],
}

impl RegisterRoleMap {
    /// Slot holding `MR_TAG` on send
    pub const fn tag_slot(&self) -> usize {
        self.primary[MR_TAG]
    }

    /// Slot holding `MR_SENDER` on receive
    pub const fn sender_slot(&self) -> usize {
        self.primary[MR_SENDER]
    }

    /// Slot holding `MR_RETURN` on completion
    pub const fn return_slot(&self) -> usize {
        self.primary[MR_RETURN]
    }

    /// Every role slot lies inside the file and no slot has two roles.
    pub const fn is_valid(&self) -> bool {
        let mut slots = [0usize; SYSTEM_REGS + MR_TOTAL];
        let mut n = 0;
        while n < SYSTEM_REGS {
            slots[n] = self.system[n];
            n += 1;
        }
        while n < SYSTEM_REGS + MR_TOTAL {
            slots[n] = self.primary[n - SYSTEM_REGS];
            n += 1;
        }

        let mut i = 0;
        while i < slots.len() {
            if slots[i] >= self.file_len {
                return false;
            }
            let mut j = i + 1;
            while j < slots.len() {
                if slots[i] == slots[j] {
                    return false;
                }
                j += 1;
            }
            i += 1;
        }
        true
    }
}

/// ARM: r0-r12, sp, lr, pc
pub mod arm {
    use super::RegisterRoleMap;

    pub const REGISTER_COUNT: usize = 16;

    pub const ROLE_MAP: RegisterRoleMap = RegisterRoleMap {
        file_len: REGISTER_COUNT,
        system: [0, 1, 2],
        primary: [3, 4, 5, 6, 7, 8],
    };
}

/// RISC-V (RV32): x0-x31, arguments in a0-a7
pub mod riscv32 {
    use super::RegisterRoleMap;

    pub const REGISTER_COUNT: usize = 32;

    /// a0-a2 system, a3-a7 and s2 primaries
    pub const ROLE_MAP: RegisterRoleMap = RegisterRoleMap {
        file_len: REGISTER_COUNT,
        system: [10, 11, 12],
        primary: [13, 14, 15, 16, 17, 18],
    };
}

#[cfg(not(feature = "arch-riscv32"))]
pub use arm::{REGISTER_COUNT, ROLE_MAP};
#[cfg(feature = "arch-riscv32")]
pub use riscv32::{REGISTER_COUNT, ROLE_MAP};

const_assert!(arm::ROLE_MAP.is_valid());
const_assert!(riscv32::ROLE_MAP.is_valid());
const_assert!(REGISTER_COUNT >= SYSTEM_REGS + MR_TOTAL);
const_assert!(MR_TAG == MR_RETURN);

/// Accessor over a thread's syscall registers.
///
/// The transfer engine is written against this trait instead of a concrete
/// trap frame so it can run without real traps.
pub trait SyscallRegisters {
    /// Read system register `n` (`n < SYSTEM_REGS`)
    fn system_arg(&self, n: usize) -> Word;

    /// Write system register `n` (`n < SYSTEM_REGS`)
    fn set_system_arg(&mut self, n: usize, value: Word);

    /// Read primary message register `n` (`n < MR_TOTAL`)
    fn primary(&self, n: usize) -> Word;

    /// Write primary message register `n` (`n < MR_TOTAL`)
    fn set_primary(&mut self, n: usize, value: Word);

    #[inline]
    fn flags(&self) -> Word {
        self.system_arg(SYS_FLAGS)
    }

    #[inline]
    fn set_flags(&mut self, flags: Word) {
        self.set_system_arg(SYS_FLAGS, flags);
    }

    #[inline]
    fn tag(&self) -> Word {
        self.primary(MR_TAG)
    }

    #[inline]
    fn set_tag(&mut self, tag: Word) {
        self.set_primary(MR_TAG, tag);
    }

    #[inline]
    fn sender(&self) -> Word {
        self.primary(MR_SENDER)
    }

    #[inline]
    fn set_sender(&mut self, sender: Word) {
        self.set_primary(MR_SENDER, sender);
    }

    #[inline]
    fn return_value(&self) -> Word {
        self.primary(MR_RETURN)
    }

    #[inline]
    fn set_return_value(&mut self, value: Word) {
        self.set_primary(MR_RETURN, value);
    }

    /// Snapshot of MR0-MR5
    fn primaries(&self) -> [Word; MR_TOTAL] {
        let mut mrs = [0; MR_TOTAL];
        for (n, mr) in mrs.iter_mut().enumerate() {
            *mr = self.primary(n);
        }
        mrs
    }

    /// Overwrite MR0-MR5
    fn set_primaries(&mut self, mrs: &[Word; MR_TOTAL]) {
        for (n, mr) in mrs.iter().enumerate() {
            self.set_primary(n, *mr);
        }
    }
}

/// Saved register file of one thread, indexed by physical slot
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    slots: [Word; REGISTER_COUNT],
}

impl RegisterFile {
    /// Create a register file with all slots zeroed
    pub const fn new() -> Self {
        Self {
            slots: [0; REGISTER_COUNT],
        }
    }

    /// Read a raw slot
    #[inline]
    pub fn slot(&self, index: usize) -> Word {
        self.slots[index]
    }

    /// Write a raw slot
    #[inline]
    pub fn set_slot(&mut self, index: usize, value: Word) {
        self.slots[index] = value;
    }

    /// Syscall library argument `n` (MR2-MR5)
    #[inline]
    pub fn syscall_arg(&self, n: usize) -> Word {
        assert!(n < MR_USABLE_TOTAL, "syscall argument {} out of range", n);
        self.primary(MR_UNUSED_START + n)
    }

    /// Set syscall library argument `n` (MR2-MR5)
    #[inline]
    pub fn set_syscall_arg(&mut self, n: usize, value: Word) {
        assert!(n < MR_USABLE_TOTAL, "syscall argument {} out of range", n);
        self.set_primary(MR_UNUSED_START + n, value);
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallRegisters for RegisterFile {
    #[inline]
    fn system_arg(&self, n: usize) -> Word {
        self.slots[ROLE_MAP.system[n]]
    }

    #[inline]
    fn set_system_arg(&mut self, n: usize, value: Word) {
        self.slots[ROLE_MAP.system[n]] = value;
    }

    #[inline]
    fn primary(&self, n: usize) -> Word {
        self.slots[ROLE_MAP.primary[n]]
    }

    #[inline]
    fn set_primary(&mut self, n: usize, value: Word) {
        self.slots[ROLE_MAP.primary[n]] = value;
    }
}

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterFile")
            .field("flags", &format_args!("{:#010x}", self.flags()))
            .field("system", &[self.system_arg(0), self.system_arg(1), self.system_arg(2)])
            .field("mrs", &self.primaries())
            .finish()
    }
}
