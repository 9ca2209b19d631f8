//! TCB Region (UTCB) Layout
//!
//! Each thread owns one fixed-size UTCB. Kernel and user library agree on its
//! layout at build time, word for word:
//!
//! ```text
//! word 0..6    mr[0..6]       mirror of the primary MRs (MR0-MR5)
//! word 6       saved_tag      MR_TAG of an interrupted (stacked) IPC
//! word 7       saved_sender   MR_SENDER of an interrupted (stacked) IPC
//! word 8..64   mr_rest[..]    secondary MRs, copied by full IPC only
//! ```
//!
//! Both real and non-real message registers have a location here, but the
//! secondary ones are only moved when the FULL flag is set.

use core::fmt;
use core::mem::offset_of;

use static_assertions::{assert_eq_size, const_assert_eq};

use crate::config::UTCB_SIZE;
use crate::error::DescriptorError;
use crate::registers::{Word, MR_SENDER, MR_TAG, MR_TOTAL, WORD_SIZE};

/// Words in a UTCB
pub const UTCB_WORDS: usize = UTCB_SIZE / WORD_SIZE;

/// Secondary message registers (-2 is for the saved fields)
pub const MR_REST: usize = UTCB_WORDS - MR_TOTAL - 2;

/// Byte capacity of the secondary MRs; memcpy-style helpers take this as limit
pub const UTCB_FULL_BUFFER_SIZE: usize = MR_REST * WORD_SIZE;

/// Per-thread message staging area
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Utcb {
    /// MRs that are mapped to real registers
    mr: [Word; MR_TOTAL],
    /// Saved tag field for stacked IPCs
    saved_tag: Word,
    /// Saved sender field for stacked IPCs
    saved_sender: Word,
    /// Completes the UTCB up to `UTCB_WORDS`
    mr_rest: [Word; MR_REST],
}

assert_eq_size!(Utcb, [u8; UTCB_SIZE]);
const_assert_eq!(offset_of!(Utcb, mr), 0);
const_assert_eq!(offset_of!(Utcb, saved_tag), MR_TOTAL * WORD_SIZE);
const_assert_eq!(offset_of!(Utcb, saved_sender), (MR_TOTAL + 1) * WORD_SIZE);
const_assert_eq!(offset_of!(Utcb, mr_rest), (MR_TOTAL + 2) * WORD_SIZE);

impl Utcb {
    /// Create a zeroed UTCB
    pub const fn new() -> Self {
        Self {
            mr: [0; MR_TOTAL],
            saved_tag: 0,
            saved_sender: 0,
            mr_rest: [0; MR_REST],
        }
    }

    /// Read primary mirror `i`
    ///
    /// # Panics
    /// If `i >= MR_TOTAL`
    #[inline]
    pub fn read_primary(&self, i: usize) -> Word {
        assert!(i < MR_TOTAL, "primary MR {} out of range (MR_TOTAL = {})", i, MR_TOTAL);
        self.mr[i]
    }

    /// Write primary mirror `i`
    ///
    /// # Panics
    /// If `i >= MR_TOTAL`
    #[inline]
    pub fn write_primary(&mut self, i: usize, value: Word) {
        assert!(i < MR_TOTAL, "primary MR {} out of range (MR_TOTAL = {})", i, MR_TOTAL);
        self.mr[i] = value;
    }

    /// Read secondary MR `i`
    ///
    /// # Panics
    /// If `i >= MR_REST`
    #[inline]
    pub fn read_rest(&self, i: usize) -> Word {
        assert!(i < MR_REST, "secondary MR {} out of range (MR_REST = {})", i, MR_REST);
        self.mr_rest[i]
    }

    /// Write secondary MR `i`
    ///
    /// # Panics
    /// If `i >= MR_REST`
    #[inline]
    pub fn write_rest(&mut self, i: usize, value: Word) {
        assert!(i < MR_REST, "secondary MR {} out of range (MR_REST = {})", i, MR_REST);
        self.mr_rest[i] = value;
    }

    /// Read MR `n` in the unified index space (primaries, then secondaries)
    #[inline]
    pub fn read_mr(&self, n: usize) -> Word {
        if n < MR_TOTAL {
            self.read_primary(n)
        } else {
            self.read_rest(n - MR_TOTAL)
        }
    }

    /// Write MR `n` in the unified index space
    #[inline]
    pub fn write_mr(&mut self, n: usize, value: Word) {
        if n < MR_TOTAL {
            self.write_primary(n, value)
        } else {
            self.write_rest(n - MR_TOTAL, value)
        }
    }

    #[inline]
    pub fn primaries(&self) -> &[Word; MR_TOTAL] {
        &self.mr
    }

    #[inline]
    pub fn set_primaries(&mut self, mrs: &[Word; MR_TOTAL]) {
        self.mr = *mrs;
    }

    #[inline]
    pub fn rest(&self) -> &[Word; MR_REST] {
        &self.mr_rest
    }

    #[inline]
    pub fn rest_mut(&mut self) -> &mut [Word; MR_REST] {
        &mut self.mr_rest
    }

    #[inline]
    pub fn saved_tag(&self) -> Word {
        self.saved_tag
    }

    #[inline]
    pub fn saved_sender(&self) -> Word {
        self.saved_sender
    }

    /// Stack the current tag/sender before a nested IPC overwrites them
    pub fn save_nested(&mut self) {
        self.saved_tag = self.mr[MR_TAG];
        self.saved_sender = self.mr[MR_SENDER];
    }

    /// Put back the tag/sender stacked by [`save_nested`](Self::save_nested)
    pub fn restore_nested(&mut self) {
        self.mr[MR_TAG] = self.saved_tag;
        self.mr[MR_SENDER] = self.saved_sender;
    }

    /// Copy bytes into the secondary MRs, starting at MR_REST[0]
    ///
    /// # Errors
    /// Returns `DescriptorError::Oversize` if `data` exceeds
    /// `UTCB_FULL_BUFFER_SIZE`; nothing is written in that case.
    pub fn copy_to_full_buffer(&mut self, data: &[u8]) -> Result<(), DescriptorError> {
        if data.len() > UTCB_FULL_BUFFER_SIZE {
            return Err(DescriptorError::Oversize {
                size: data.len(),
                max: UTCB_FULL_BUFFER_SIZE,
            });
        }

        for (word, chunk) in self.mr_rest.iter_mut().zip(data.chunks(WORD_SIZE)) {
            let mut bytes = word.to_ne_bytes();
            bytes[..chunk.len()].copy_from_slice(chunk);
            *word = Word::from_ne_bytes(bytes);
        }
        Ok(())
    }

    /// Copy bytes out of the secondary MRs into `buf`
    ///
    /// # Errors
    /// Returns `DescriptorError::Oversize` if `buf` exceeds
    /// `UTCB_FULL_BUFFER_SIZE`.
    pub fn copy_from_full_buffer(&self, buf: &mut [u8]) -> Result<(), DescriptorError> {
        if buf.len() > UTCB_FULL_BUFFER_SIZE {
            return Err(DescriptorError::Oversize {
                size: buf.len(),
                max: UTCB_FULL_BUFFER_SIZE,
            });
        }

        for (word, chunk) in self.mr_rest.iter().zip(buf.chunks_mut(WORD_SIZE)) {
            let len = chunk.len();
            chunk.copy_from_slice(&word.to_ne_bytes()[..len]);
        }
        Ok(())
    }

    /// The region as laid out in memory, word by word
    pub fn to_words(&self) -> [Word; UTCB_WORDS] {
        let mut words = [0; UTCB_WORDS];
        words[..MR_TOTAL].copy_from_slice(&self.mr);
        words[MR_TOTAL] = self.saved_tag;
        words[MR_TOTAL + 1] = self.saved_sender;
        words[MR_TOTAL + 2..].copy_from_slice(&self.mr_rest);
        words
    }
}

impl Default for Utcb {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Utcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Utcb")
            .field("mr", &self.mr)
            .field("saved_tag", &format_args!("{:#x}", self.saved_tag))
            .field("saved_sender", &self.saved_sender)
            .field("mr_rest", &&self.mr_rest[..8])
            .finish()
    }
}
