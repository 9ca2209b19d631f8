//! Extended-Copy Fault Handler
//!
//! Extended IPC copies user buffers that may not be resident. The copy loop
//! never touches more than one page per access; when an access misses, it
//! calls [`FaultHandler::resolve`] with the faulting address and direction,
//! which asks the virtual-memory collaborator to page in exactly that page.
//!
//! The handler is the only place an IPC may block for an unbounded time
//! (while the pager works). Each call is bounded to one page, and a page that
//! faults again after being resolved is reported as unresolvable so a
//! misbehaving pager cannot livelock the transfer.

use core::fmt;

use log::{debug, warn};

use crate::config::{IPC_EXTENDED_MAX_SIZE, PAGE_SIZE};
use crate::error::PagerError;
use crate::registers::Word;
use crate::tcb::ThreadId;

/// Which side of an extended copy faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reading the sender's source buffer
    SenderRead,
    /// Writing the receiver's destination buffer
    ReceiverWrite,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SenderRead => f.write_str("sender read"),
            Direction::ReceiverWrite => f.write_str("receiver write"),
        }
    }
}

/// An access hit a page that is not resident
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotResident {
    pub address: Word,
}

/// Virtual-memory collaborator
///
/// The transport never walks page tables itself. `read`/`write` are only
/// ever called with ranges that stay inside one page.
pub trait VirtualMemory {
    /// Copy `buf.len()` bytes out of `tid`'s address space at `vaddr`
    fn read(&self, tid: ThreadId, vaddr: Word, buf: &mut [u8]) -> Result<(), NotResident>;

    /// Copy `data` into `tid`'s address space at `vaddr`
    fn write(&mut self, tid: ThreadId, vaddr: Word, data: &[u8]) -> Result<(), NotResident>;

    /// Whether the page holding `vaddr` can be accessed without faulting
    fn is_resident(&self, tid: ThreadId, vaddr: Word, direction: Direction) -> bool;

    /// Page in the page holding `vaddr`, blocking until done
    fn resolve_page(&mut self, tid: ThreadId, vaddr: Word, direction: Direction) -> Result<(), PagerError>;
}

/// Result of one fault resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Resolution {
    Resolved,
    Unresolvable(PagerError),
}

/// Base address of the page holding `address`
#[inline]
pub const fn page_base(address: Word) -> Word {
    address & !((PAGE_SIZE as Word) - 1)
}

/// Bytes from `address` to the end of its page
#[inline]
pub const fn page_remaining(address: Word) -> usize {
    PAGE_SIZE - (address as usize & (PAGE_SIZE - 1))
}

/// Worst-case number of pages a `len`-byte buffer can touch
pub const fn max_pages_spanned(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        (len - 1 + PAGE_SIZE - 1) / PAGE_SIZE + 1
    }
}

/// Most resolutions one extended transfer can need (both directions)
pub const MAX_RESOLUTIONS: usize = 2 * max_pages_spanned(IPC_EXTENDED_MAX_SIZE);

/// Fault handler for one extended transfer between a sender and a receiver
pub struct FaultHandler<'a, V: VirtualMemory> {
    vm: &'a mut V,
    sender: ThreadId,
    receiver: ThreadId,
    resolved: [Option<(Direction, Word)>; MAX_RESOLUTIONS],
    count: usize,
}

impl<'a, V: VirtualMemory> FaultHandler<'a, V> {
    pub fn new(vm: &'a mut V, sender: ThreadId, receiver: ThreadId) -> Self {
        Self {
            vm,
            sender,
            receiver,
            resolved: [None; MAX_RESOLUTIONS],
            count: 0,
        }
    }

    /// Thread whose memory `direction` touches
    #[inline]
    pub fn party(&self, direction: Direction) -> ThreadId {
        match direction {
            Direction::SenderRead => self.sender,
            Direction::ReceiverWrite => self.receiver,
        }
    }

    /// Number of pages resolved so far
    #[inline]
    pub fn pages_resolved(&self) -> usize {
        self.count
    }

    /// Read from the sender's buffer (within one page)
    #[inline]
    pub fn read(&self, vaddr: Word, buf: &mut [u8]) -> Result<(), NotResident> {
        debug_assert!(buf.len() <= page_remaining(vaddr));
        self.vm.read(self.sender, vaddr, buf)
    }

    /// Write to the receiver's buffer (within one page)
    #[inline]
    pub fn write(&mut self, vaddr: Word, data: &[u8]) -> Result<(), NotResident> {
        debug_assert!(data.len() <= page_remaining(vaddr));
        self.vm.write(self.receiver, vaddr, data)
    }

    #[inline]
    pub fn is_resident(&self, vaddr: Word, direction: Direction) -> bool {
        self.vm.is_resident(self.party(direction), vaddr, direction)
    }

    /// Resolve the one missing page holding `address`
    pub fn resolve(&mut self, address: Word, direction: Direction) -> Resolution {
        let page = page_base(address);
        let seen = self.resolved[..self.count]
            .iter()
            .any(|entry| *entry == Some((direction, page)));
        if seen {
            warn!("ipc: page {:#x} ({}) faulted again after resolution", page, direction);
            return Resolution::Unresolvable(PagerError::AlreadyResolved { page });
        }
        if self.count == MAX_RESOLUTIONS {
            warn!("ipc: fault budget exhausted at {:#x} ({})", address, direction);
            return Resolution::Unresolvable(PagerError::Exhausted);
        }

        let tid = self.party(direction);
        match self.vm.resolve_page(tid, address, direction) {
            Ok(()) => {
                debug!("ipc: resolved {} page {:#x} for {}", direction, page, tid);
                self.resolved[self.count] = Some((direction, page));
                self.count += 1;
                Resolution::Resolved
            }
            Err(err) => {
                warn!("ipc: cannot resolve {:#x} for {} ({}): {}", address, tid, direction, err);
                Resolution::Unresolvable(err)
            }
        }
    }
}
