//! IPC Flags Codec
//!
//! The flags word is passed in the third system register and packs four
//! fields into 32 bits:
//!
//! ```text
//! 31    28 27          16 15   12 11         4 3      0
//! +-------+--------------+-------+------------+--------+
//! | error |     size     | rsvd  |  MR index  |  type  |
//! +-------+--------------+-------+------------+--------+
//! ```
//!
//! - type: 0 = short, 1 = full, 2 = extended
//! - MR index: primary MR holding the buffer address (extended only)
//! - size: payload bytes, at most [`IPC_EXTENDED_MAX_SIZE`] (extended only)
//! - error: set by the kernel on the return path only
//!
//! Reserved bits are ignored on decode.

use bitflags::bitflags;

use crate::config::IPC_EXTENDED_MAX_SIZE;
use crate::error::DescriptorError;
use crate::registers::MR_TOTAL;

/// Short IPC involves just primary message registers
pub const IPC_FLAGS_SHORT: u32 = 0x0000_0000;
/// Full IPC involves full UTCB copy
pub const IPC_FLAGS_FULL: u32 = 0x0000_0001;
/// Extended IPC can page-fault and copy up to 2KB
pub const IPC_FLAGS_EXTENDED: u32 = 0x0000_0002;

pub const IPC_FLAGS_TYPE_MASK: u32 = 0x0000_000F;
pub const IPC_FLAGS_MSG_INDEX_MASK: u32 = 0x0000_0FF0;
pub const IPC_FLAGS_MSG_INDEX_SHIFT: u32 = 4;
pub const IPC_FLAGS_SIZE_MASK: u32 = 0x0FFF_0000;
pub const IPC_FLAGS_SIZE_SHIFT: u32 = 16;
pub const IPC_FLAGS_ERROR_MASK: u32 = 0xF000_0000;
pub const IPC_FLAGS_ERROR_SHIFT: u32 = 28;

/// Copy fault during extended IPC
pub const IPC_EFAULT: u32 = 1 << 28;
/// No matching IPC in flight
pub const IPC_ENOIPC: u32 = 1 << 29;
/// Descriptor rejected before copying
pub const IPC_EINVAL: u32 = 1 << 30;

bitflags! {
    /// Transfer-type bits (short is the absence of both)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeBits: u32 {
        const FULL     = IPC_FLAGS_FULL;
        const EXTENDED = IPC_FLAGS_EXTENDED;
    }
}

/// Validated extended descriptor
///
/// Only [`IpcType::extended`] and [`IpcType::decode`] build one, so `size`
/// always fits the wire field and `index` always names a primary MR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extended {
    size: u16,
    index: u8,
}

impl Extended {
    /// Payload size in bytes (at most [`IPC_EXTENDED_MAX_SIZE`])
    #[inline]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    /// Primary MR holding the buffer address
    #[inline]
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

/// Transfer protocol requested by a flags word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcType {
    /// Primary MRs only
    Short,
    /// Primary MRs plus every secondary MR in the UTCB
    Full,
    /// Primary MRs plus `size` bytes addressed by primary MR `index`
    Extended(Extended),
}

impl IpcType {
    /// Validated extended descriptor
    ///
    /// # Errors
    /// `Oversize` past [`IPC_EXTENDED_MAX_SIZE`], `BadIndex` if `index` is not
    /// a primary MR.
    pub fn extended(size: usize, index: usize) -> Result<Self, DescriptorError> {
        if size > IPC_EXTENDED_MAX_SIZE {
            return Err(DescriptorError::Oversize {
                size,
                max: IPC_EXTENDED_MAX_SIZE,
            });
        }
        if index >= MR_TOTAL {
            return Err(DescriptorError::BadIndex { index });
        }
        Ok(IpcType::Extended(Extended {
            size: size as u16,
            index: index as u8,
        }))
    }

    /// Protocol name used in logs and errors
    pub const fn name(&self) -> &'static str {
        match self {
            IpcType::Short => "short",
            IpcType::Full => "full",
            IpcType::Extended(_) => "extended",
        }
    }

    /// Extended payload size in bytes (0 for short/full)
    pub const fn payload_size(&self) -> usize {
        match self {
            IpcType::Extended(ext) => ext.size(),
            _ => 0,
        }
    }

    /// Pack into the wire format
    pub const fn encode(&self) -> u32 {
        match self {
            IpcType::Short => IPC_FLAGS_SHORT,
            IpcType::Full => IPC_FLAGS_FULL,
            IpcType::Extended(ext) => {
                IPC_FLAGS_EXTENDED
                    | ((ext.index as u32) << IPC_FLAGS_MSG_INDEX_SHIFT)
                    | ((ext.size as u32) << IPC_FLAGS_SIZE_SHIFT)
            }
        }
    }

    /// Unpack a request flags word
    ///
    /// The error nibble and reserved bits are ignored.
    ///
    /// # Errors
    /// - `MultipleTypes` if both FULL and EXTENDED are set
    /// - `UnknownType` for any other type bit
    /// - `UnusedField` if short/full carry a size or index
    /// - `Oversize` / `BadIndex` for an extended descriptor out of range
    pub fn decode(flags: u32) -> Result<Self, DescriptorError> {
        let bits = flags & IPC_FLAGS_TYPE_MASK;
        let index = ((flags & IPC_FLAGS_MSG_INDEX_MASK) >> IPC_FLAGS_MSG_INDEX_SHIFT) as usize;
        let size = ((flags & IPC_FLAGS_SIZE_MASK) >> IPC_FLAGS_SIZE_SHIFT) as usize;

        let ty = TypeBits::from_bits(bits).ok_or(DescriptorError::UnknownType { bits })?;
        if ty.bits().count_ones() > 1 {
            return Err(DescriptorError::MultipleTypes { bits });
        }

        if ty.contains(TypeBits::EXTENDED) {
            return IpcType::extended(size, index);
        }

        let decoded = if ty.contains(TypeBits::FULL) {
            IpcType::Full
        } else {
            IpcType::Short
        };
        if size != 0 || index != 0 {
            return Err(DescriptorError::UnusedField {
                kind: decoded.name(),
            });
        }
        Ok(decoded)
    }
}

/// Free-function form of [`IpcType::encode`]
#[inline]
pub const fn encode(ty: IpcType) -> u32 {
    ty.encode()
}

/// Free-function form of [`IpcType::decode`]
#[inline]
pub fn decode(flags: u32) -> Result<IpcType, DescriptorError> {
    IpcType::decode(flags)
}

/// Error code carried in the top nibble on the return path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Fault during extended copy
    Fault,
    /// No matching IPC in flight
    NoIpc,
    /// Malformed descriptor
    Invalid,
    /// A code defined by a layer above the transport
    Other(UserCode),
}

/// Error nibble owned by a layer above the transport
///
/// Never 0 (no error) and never one of the transport's own nibbles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserCode(u8);

impl UserCode {
    /// Nibbles the transport reserves for itself
    pub const RESERVED: [u8; 4] = [0, 1, 2, 4];

    /// `None` if `nibble` is reserved or does not fit in four bits
    pub const fn new(nibble: u8) -> Option<Self> {
        match nibble {
            0 | 1 | 2 | 4 => None,
            n if n > 0xF => None,
            n => Some(UserCode(n)),
        }
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl ErrorCode {
    /// Value of the error nibble
    pub const fn nibble(self) -> u32 {
        match self {
            ErrorCode::Fault => IPC_EFAULT >> IPC_FLAGS_ERROR_SHIFT,
            ErrorCode::NoIpc => IPC_ENOIPC >> IPC_FLAGS_ERROR_SHIFT,
            ErrorCode::Invalid => IPC_EINVAL >> IPC_FLAGS_ERROR_SHIFT,
            ErrorCode::Other(code) => code.0 as u32,
        }
    }

    /// Interpret an error nibble; 0 means no error
    pub const fn from_nibble(nibble: u32) -> Option<Self> {
        match nibble & 0xF {
            0 => None,
            1 => Some(ErrorCode::Fault),
            2 => Some(ErrorCode::NoIpc),
            4 => Some(ErrorCode::Invalid),
            other => Some(ErrorCode::Other(UserCode(other as u8))),
        }
    }
}

/// Error bits for `code`, ready to be or-ed into a flags word
#[inline]
pub const fn encode_error(code: ErrorCode) -> u32 {
    code.nibble() << IPC_FLAGS_ERROR_SHIFT
}

/// Error carried by a completed flags word, if any
#[inline]
pub const fn decode_error(flags: u32) -> Option<ErrorCode> {
    ErrorCode::from_nibble((flags & IPC_FLAGS_ERROR_MASK) >> IPC_FLAGS_ERROR_SHIFT)
}

/// Replace the error nibble of `flags` (`None` clears it)
#[inline]
pub const fn with_error(flags: u32, code: Option<ErrorCode>) -> u32 {
    let cleared = flags & !IPC_FLAGS_ERROR_MASK;
    match code {
        Some(code) => cleared | encode_error(code),
        None => cleared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_bit_exact() {
        assert_eq!(IpcType::Short.encode(), 0);
        assert_eq!(IpcType::Full.encode(), 1);
        let ext = IpcType::extended(2048, 3).unwrap();
        assert_eq!(ext.encode(), 0x0800_0032);
    }

    #[test]
    fn decode_extended_fields() {
        let flags = IPC_FLAGS_EXTENDED | (5 << IPC_FLAGS_MSG_INDEX_SHIFT) | (100 << IPC_FLAGS_SIZE_SHIFT);
        let ty = decode(flags).unwrap();
        assert_eq!(ty, IpcType::extended(100, 5).unwrap());
        assert_eq!(ty.payload_size(), 100);
        match ty {
            IpcType::Extended(ext) => assert_eq!(ext.index(), 5),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn multiple_type_bits_rejected() {
        assert_eq!(
            decode(IPC_FLAGS_FULL | IPC_FLAGS_EXTENDED),
            Err(DescriptorError::MultipleTypes { bits: 3 })
        );
        assert_eq!(decode(0x4), Err(DescriptorError::UnknownType { bits: 4 }));
    }

    #[test]
    fn unused_fields_rejected() {
        assert_eq!(
            decode(IPC_FLAGS_FULL | (1 << IPC_FLAGS_SIZE_SHIFT)),
            Err(DescriptorError::UnusedField { kind: "full" })
        );
        assert_eq!(
            decode(IPC_FLAGS_SHORT | (2 << IPC_FLAGS_MSG_INDEX_SHIFT)),
            Err(DescriptorError::UnusedField { kind: "short" })
        );
    }

    #[test]
    fn oversize_rejected_not_truncated() {
        let flags = IPC_FLAGS_EXTENDED | (2 << IPC_FLAGS_MSG_INDEX_SHIFT) | (2049 << IPC_FLAGS_SIZE_SHIFT);
        assert_eq!(
            decode(flags),
            Err(DescriptorError::Oversize { size: 2049, max: 2048 })
        );
        assert!(IpcType::extended(IPC_EXTENDED_MAX_SIZE + 1, 2).is_err());
    }

    #[test]
    fn sizes_past_the_field_never_reach_the_wire() {
        // 4096 would mask to a zero-size descriptor
        assert_eq!(
            IpcType::extended(4096, 2),
            Err(DescriptorError::Oversize { size: 4096, max: 2048 })
        );
        assert!(IpcType::extended(usize::MAX, 0).is_err());
        assert!(IpcType::extended(16, MR_TOTAL).is_err());

        let max = IpcType::extended(IPC_EXTENDED_MAX_SIZE, 5).unwrap().encode();
        assert_eq!(decode(max), IpcType::extended(IPC_EXTENDED_MAX_SIZE, 5));
    }

    #[test]
    fn user_codes_cannot_alias_transport_errors() {
        for reserved in UserCode::RESERVED {
            assert_eq!(UserCode::new(reserved), None);
        }
        assert_eq!(UserCode::new(0x10), None);

        for nibble in [3u8, 5, 6, 7, 8, 15] {
            let code = ErrorCode::Other(UserCode::new(nibble).unwrap());
            assert_eq!(decode_error(encode_error(code)), Some(code));
        }
    }

    #[test]
    fn index_must_name_a_primary() {
        let flags = IPC_FLAGS_EXTENDED | (6 << IPC_FLAGS_MSG_INDEX_SHIFT);
        assert_eq!(decode(flags), Err(DescriptorError::BadIndex { index: 6 }));
    }

    #[test]
    fn reserved_and_error_bits_ignored_on_decode() {
        let flags = IPC_FLAGS_FULL | 0x0000_F000 | IPC_EFAULT;
        assert_eq!(decode(flags), Ok(IpcType::Full));
    }

    #[test]
    fn error_nibble() {
        assert_eq!(encode_error(ErrorCode::Fault), IPC_EFAULT);
        assert_eq!(encode_error(ErrorCode::NoIpc), IPC_ENOIPC);
        assert_eq!(decode_error(IPC_FLAGS_FULL), None);
        assert_eq!(decode_error(IPC_ENOIPC | IPC_FLAGS_FULL), Some(ErrorCode::NoIpc));
        assert_eq!(decode_error(0x8000_0000), Some(ErrorCode::Other(UserCode(8))));

        let flags = with_error(IPC_FLAGS_FULL | IPC_EFAULT, Some(ErrorCode::NoIpc));
        assert_eq!(flags, IPC_FLAGS_FULL | IPC_ENOIPC);
        assert_eq!(with_error(flags, None), IPC_FLAGS_FULL);
    }
}
