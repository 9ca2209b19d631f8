//! Mock virtual-memory backend
//!
//! In-memory paged address spaces for testing the transport without a real
//! pager. Each page of each thread is in one of three states:
//! - resident: accessible, no fault
//! - swapped: faults, but `resolve_page` brings it in
//! - unresolvable: faults, and `resolve_page` fails (bad address)
//!
//! Every `resolve_page` call is recorded so tests can check which faults
//! were raised and in what order.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::error::PagerError;
use crate::fault::{page_base, Direction, NotResident, VirtualMemory};
use crate::registers::Word;
use crate::tcb::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    Resident,
    Swapped,
    Unresolvable,
}

#[derive(Debug, Clone)]
struct Page {
    backing: Backing,
    data: Vec<u8>,
}

/// One recorded `resolve_page` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub tid: ThreadId,
    pub address: Word,
    pub direction: Direction,
}

/// Paged memory for any number of threads
#[derive(Debug, Default)]
pub struct MockMemory {
    pages: BTreeMap<(ThreadId, Word), Page>,
    resolutions: Vec<PageRequest>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_with(&mut self, tid: ThreadId, vaddr: Word, len: usize, backing: Backing) {
        if len == 0 {
            return;
        }
        let first = page_base(vaddr);
        let last = page_base(vaddr + (len - 1) as Word);
        let mut page = first;
        loop {
            self.pages.insert(
                (tid, page),
                Page {
                    backing,
                    data: vec![0; PAGE_SIZE],
                },
            );
            if page == last {
                break;
            }
            page += PAGE_SIZE as Word;
        }
    }

    /// Map `len` bytes at `vaddr` as resident, zero-filled pages
    pub fn map(&mut self, tid: ThreadId, vaddr: Word, len: usize) {
        self.map_with(tid, vaddr, len, Backing::Resident);
    }

    /// Map `len` bytes at `vaddr` as valid but paged out
    pub fn map_swapped(&mut self, tid: ThreadId, vaddr: Word, len: usize) {
        self.map_with(tid, vaddr, len, Backing::Swapped);
    }

    /// Map `len` bytes at `vaddr` as pages the pager cannot bring in
    pub fn map_unresolvable(&mut self, tid: ThreadId, vaddr: Word, len: usize) {
        self.map_with(tid, vaddr, len, Backing::Unresolvable);
    }

    /// Page out the page holding `vaddr` (contents are kept)
    pub fn evict(&mut self, tid: ThreadId, vaddr: Word) {
        if let Some(page) = self.pages.get_mut(&(tid, page_base(vaddr))) {
            page.backing = Backing::Swapped;
        }
    }

    /// Whether the page holding `vaddr` is resident
    pub fn resident(&self, tid: ThreadId, vaddr: Word) -> bool {
        matches!(
            self.pages.get(&(tid, page_base(vaddr))),
            Some(Page { backing: Backing::Resident, .. })
        )
    }

    /// Write bytes into backing store regardless of residency
    ///
    /// # Panics
    /// If any byte falls outside a mapped page
    pub fn fill(&mut self, tid: ThreadId, vaddr: Word, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            let address = vaddr + offset as Word;
            let page = self
                .pages
                .get_mut(&(tid, page_base(address)))
                .expect("fill outside mapped memory");
            page.data[(address - page_base(address)) as usize] = *byte;
        }
    }

    /// Read bytes from backing store regardless of residency
    ///
    /// # Panics
    /// If any byte falls outside a mapped page
    pub fn bytes(&self, tid: ThreadId, vaddr: Word, len: usize) -> Vec<u8> {
        (0..len)
            .map(|offset| {
                let address = vaddr + offset as Word;
                let page = self
                    .pages
                    .get(&(tid, page_base(address)))
                    .expect("read outside mapped memory");
                page.data[(address - page_base(address)) as usize]
            })
            .collect()
    }

    /// Every `resolve_page` call so far, in order
    pub fn resolutions(&self) -> &[PageRequest] {
        &self.resolutions
    }

    fn page(&self, tid: ThreadId, vaddr: Word) -> Result<&Page, NotResident> {
        match self.pages.get(&(tid, page_base(vaddr))) {
            Some(page) if page.backing == Backing::Resident => Ok(page),
            _ => Err(NotResident { address: vaddr }),
        }
    }
}

impl VirtualMemory for MockMemory {
    fn read(&self, tid: ThreadId, vaddr: Word, buf: &mut [u8]) -> Result<(), NotResident> {
        let page = self.page(tid, vaddr)?;
        let offset = (vaddr - page_base(vaddr)) as usize;
        buf.copy_from_slice(&page.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, tid: ThreadId, vaddr: Word, data: &[u8]) -> Result<(), NotResident> {
        self.page(tid, vaddr)?;
        let page = self
            .pages
            .get_mut(&(tid, page_base(vaddr)))
            .ok_or(NotResident { address: vaddr })?;
        let offset = (vaddr - page_base(vaddr)) as usize;
        page.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn is_resident(&self, tid: ThreadId, vaddr: Word, _direction: Direction) -> bool {
        self.resident(tid, vaddr)
    }

    fn resolve_page(&mut self, tid: ThreadId, vaddr: Word, direction: Direction) -> Result<(), PagerError> {
        self.resolutions.push(PageRequest {
            tid,
            address: vaddr,
            direction,
        });

        match self.pages.get_mut(&(tid, page_base(vaddr))) {
            Some(page) if page.backing == Backing::Unresolvable => {
                Err(PagerError::InvalidAddress { address: vaddr })
            }
            Some(page) => {
                page.backing = Backing::Resident;
                Ok(())
            }
            None => Err(PagerError::InvalidAddress { address: vaddr }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: ThreadId = ThreadId(7);

    #[test]
    fn resident_pages_read_back() {
        let mut vm = MockMemory::new();
        vm.map(T, 0x1000, 16);
        vm.fill(T, 0x1004, &[1, 2, 3]);

        let mut buf = [0u8; 4];
        vm.read(T, 0x1003, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);
    }

    #[test]
    fn swapped_pages_fault_until_resolved() {
        let mut vm = MockMemory::new();
        vm.map_swapped(T, 0x2000, PAGE_SIZE);

        let mut buf = [0u8; 1];
        assert_eq!(vm.read(T, 0x2000, &mut buf), Err(NotResident { address: 0x2000 }));
        assert!(vm.resolve_page(T, 0x2000, Direction::SenderRead).is_ok());
        assert!(vm.read(T, 0x2000, &mut buf).is_ok());
        assert_eq!(vm.resolutions().len(), 1);
    }

    #[test]
    fn unmapped_and_unresolvable_fail() {
        let mut vm = MockMemory::new();
        vm.map_unresolvable(T, 0x3000, 1);
        assert!(vm.resolve_page(T, 0x3000, Direction::ReceiverWrite).is_err());
        assert!(vm.resolve_page(T, 0x9000, Direction::ReceiverWrite).is_err());
        assert!(vm.write(T, 0x3000, &[1]).is_err());
    }

    #[test]
    fn evict_keeps_contents() {
        let mut vm = MockMemory::new();
        vm.map(T, 0x1000, PAGE_SIZE);
        vm.fill(T, 0x1000, &[9]);
        vm.evict(T, 0x1000);
        assert!(!vm.resident(T, 0x1000));
        assert_eq!(vm.bytes(T, 0x1000, 1), vec![9]);
    }

    #[test]
    fn mapping_spans_pages() {
        let mut vm = MockMemory::new();
        vm.map(T, 0x1FF0, 0x20);
        assert!(vm.resident(T, 0x1000));
        assert!(vm.resident(T, 0x2000));
        assert!(!vm.resident(T, 0x3000));
    }
}
