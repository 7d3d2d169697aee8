#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of the section header at the start of every data section.
pub const IGF_SECT_HDR_LEN: usize = 32;
/// Byte offset at which the section CRC coverage starts (the CRC field itself
/// is excluded).
pub const SECTION_IMAGE_CRC_START: usize = 4;
/// `next_section` sentinel terminating a partition chain.
pub const SECTION_END_OF_CHAIN: u32 = 0xFFFF_FFFF;
/// Placeholder CRC written before the real value is computed.
pub const CRC_DUMMY: u32 = 0x5555_5555;

/// Highest partition minor addressable by the flash driver.
pub const IGF_MAX_MINORS: u32 = 256;
/// Partition descriptor slots in the section-zero directory.
pub const DIR_MAX_MINORS: usize = 512;
/// Fragment descriptor slots in the section-zero directory.
pub const MAX_FRAGMENTS: usize = 1404;

/// Boot registry region at the very start of section zero.
pub const IGEL_BOOTREG_OFFSET: usize = 0;
pub const IGEL_BOOTREG_SIZE: usize = 0x8000;
/// The directory starts right after the boot registry.
pub const DIR_OFFSET: usize = IGEL_BOOTREG_OFFSET + IGEL_BOOTREG_SIZE;

/// Maximum extent descriptors per partition header.
pub const MAX_EXTENT_NUM: usize = 10;
/// Driver-side cap for a single extent read/write request.
pub const EXTENT_MAX_READ_WRITE_SIZE: usize = 0x0050_0000;

pub const DIRECTORY_MAGIC: &[u8; 4] = b"PDIR";
pub const BOOTREG_IDENT: &[u8; 17] = b"IGEL BOOTREGISTRY";
pub const BOOTREG_MAGIC: &[u8; 4] = b"163L";
pub const BOOTREG_FLAG_LOCK: u16 = 0x0001;
pub const BOOTSPLASH_MAGIC: &[u8; 14] = b"IGELBootSplash";
pub const HASH_HDR_IDENT: &[u8; 6] = b"chksum";
pub const EXTENTFS_MAGIC: &[u8; 4] = b"XTFS";

pub const HASH_SIGNATURE_TYPE_NONE: u8 = 0;
pub const HASH_ALGO_TYPE_NONE: u8 = 0;
/// Widest digest the hash block carries (BLAKE2b-512).
pub const HASH_BYTE_LEN: usize = 64;
/// RSA-4096 signature length in the hash header.
pub const SIGNATURE_BYTE_SIZE: usize = 512;

/// Encrypted extent container geometry: 48-byte header plus data area.
pub const EXTENTFS_HEADER_LEN: usize = 48;
pub const EXTENTFS_DATA_LEN: usize = 0x0010_0000 - EXTENTFS_HEADER_LEN;

// ── Section geometry ────────────────────────────────────────────────────────

/// Section size class, stored in the section header as
/// `log2(size / 65536)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SectionSize {
    S64K = 0,
    S128K = 1,
    S256K = 2,
    S512K = 3,
    S1M = 4,
    S2M = 5,
    S4M = 6,
    S8M = 7,
    S16M = 8,
}

impl SectionSize {
    /// The standard section size used by IGEL OS images.
    pub const STANDARD: Self = Self::S256K;

    /// Decode the on-disk exponent (`0x10000 << (exp & 0xF)`).
    #[must_use]
    pub fn from_exponent(exponent: u16) -> Option<Self> {
        match exponent & 0xF {
            0 => Some(Self::S64K),
            1 => Some(Self::S128K),
            2 => Some(Self::S256K),
            3 => Some(Self::S512K),
            4 => Some(Self::S1M),
            5 => Some(Self::S2M),
            6 => Some(Self::S4M),
            7 => Some(Self::S8M),
            8 => Some(Self::S16M),
            _ => None,
        }
    }

    #[must_use]
    pub fn exponent(self) -> u16 {
        self as u16
    }

    /// Section size in bytes.
    #[must_use]
    pub fn bytes(self) -> usize {
        0x10000 << (self as usize)
    }

    /// Number of bits to shift to convert between bytes and sections.
    #[must_use]
    pub fn shift(self) -> u32 {
        16 + self as u32
    }

    /// Byte offset of the start of section `n`.
    #[must_use]
    pub fn start_of_section(self, n: SectionNumber) -> u64 {
        u64::from(n.0) << self.shift()
    }

    /// Section containing the absolute image offset.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // image offsets fit u32 sections
    pub fn section_of(self, offset: u64) -> SectionNumber {
        SectionNumber((offset >> self.shift()) as u32)
    }

    /// Offset relative to the start of the containing section.
    #[must_use]
    pub fn offset_in_section(self, offset: u64) -> usize {
        (offset & (self.bytes() as u64 - 1)) as usize
    }
}

impl fmt::Display for SectionSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Index of a section within the image.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SectionNumber(pub u32);

/// Logical partition identifier inside IGFS (driver minor number).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionMinor(pub u32);

impl fmt::Display for SectionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartitionMinor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Partition and extent enums ──────────────────────────────────────────────

/// Partition types stored in the low byte of the partition header type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PartitionType {
    /// Partition descriptor is free.
    Empty = 0,
    /// Uncompressed writable partition.
    IgelRaw = 1,
    /// Compressed read-only partition.
    IgelCompressed = 2,
    /// Only used by the partition directory.
    IgelFreelist = 3,
    /// Uncompressed read-only partition (CRC is valid and should be checked).
    IgelRawRo = 4,
    /// Uncompressed writable partition aligned to 4k sectors.
    IgelRaw4kAligned = 5,
}

impl PartitionType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::IgelRaw),
            2 => Some(Self::IgelCompressed),
            3 => Some(Self::IgelFreelist),
            4 => Some(Self::IgelRawRo),
            5 => Some(Self::IgelRaw4kAligned),
            _ => None,
        }
    }
}

/// Partition flag bits carried in the high bits of the type field.
pub const PARTITION_FLAG_UPDATE_IN_PROGRESS: u16 = 0x100;
pub const PARTITION_FLAG_HAS_IGEL_HASH: u16 = 0x200;
pub const PARTITION_FLAG_HAS_CRYPT: u16 = 0x400;

/// Extent types as stored in the partition extent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ExtentType {
    Kernel = 1,
    Ramdisk = 2,
    Splash = 3,
    Checksums = 4,
    Squashfs = 5,
    Writeable = 6,
    Login = 7,
    SecToken = 8,
}

impl ExtentType {
    #[must_use]
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Kernel),
            2 => Some(Self::Ramdisk),
            3 => Some(Self::Splash),
            4 => Some(Self::Checksums),
            5 => Some(Self::Squashfs),
            6 => Some(Self::Writeable),
            7 => Some(Self::Login),
            8 => Some(Self::SecToken),
            _ => None,
        }
    }
}

impl fmt::Display for ExtentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kernel => "kernel",
            Self::Ramdisk => "ramdisk",
            Self::Splash => "splash",
            Self::Checksums => "checksums",
            Self::Squashfs => "squashfs",
            Self::Writeable => "writeable",
            Self::Login => "login",
            Self::SecToken => "sec_token",
        };
        f.write_str(name)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic for {context}")]
    InvalidMagic { context: &'static str },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Byte codec ──────────────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// The partition header type field is the one big-endian holdout.
#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn put_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn put_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn put_be_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn put_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn put_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn put_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

/// Decode a NUL-padded fixed-width name field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_be_u16(&bytes, 0).expect("be u16"), 0x3412);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(read_le_u32(&bytes, 6).is_err());
    }

    #[test]
    fn test_put_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        put_le_u16(&mut buf, 0, 0x1234).unwrap();
        put_be_u16(&mut buf, 2, 0x0201).unwrap();
        put_le_u32(&mut buf, 4, 0xDEAD_BEEF).unwrap();
        put_le_u64(&mut buf, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0x1234);
        assert_eq!(read_be_u16(&buf, 2).unwrap(), 0x0201);
        assert_eq!(read_le_u32(&buf, 4).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 8).unwrap(), 0x0102_0304_0506_0708);
        assert!(put_le_u32(&mut buf, 14, 0).is_err());
    }

    #[test]
    fn test_section_size_decode() {
        assert_eq!(SectionSize::from_exponent(2), Some(SectionSize::S256K));
        assert_eq!(SectionSize::S256K.bytes(), 262_144);
        assert_eq!(SectionSize::S64K.bytes(), 65_536);
        assert_eq!(SectionSize::S16M.bytes(), 16 * 1024 * 1024);
        assert_eq!(SectionSize::from_exponent(9), None);
        assert_eq!(SectionSize::STANDARD.exponent(), 2);
    }

    #[test]
    fn test_section_geometry() {
        let size = SectionSize::S256K;
        assert_eq!(size.start_of_section(SectionNumber(0)), 0);
        assert_eq!(size.start_of_section(SectionNumber(3)), 3 * 262_144);
        assert_eq!(size.section_of(262_144), SectionNumber(1));
        assert_eq!(size.section_of(262_143), SectionNumber(0));
        assert_eq!(size.offset_in_section(262_145), 1);
    }

    #[test]
    fn test_partition_type_decode() {
        assert_eq!(PartitionType::from_raw(2), Some(PartitionType::IgelCompressed));
        assert_eq!(PartitionType::from_raw(6), None);
    }

    #[test]
    fn test_extent_type_decode() {
        assert_eq!(ExtentType::from_raw(1), Some(ExtentType::Kernel));
        assert_eq!(ExtentType::from_raw(6), Some(ExtentType::Writeable));
        assert_eq!(ExtentType::from_raw(0), None);
        assert_eq!(ExtentType::Squashfs.to_string(), "squashfs");
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"sys\0\0\0"), "sys");
        assert_eq!(trim_nul_padded(b"full"), "full");
    }

    #[test]
    fn test_extentfs_geometry() {
        // Header plus data area make up exactly one 1 MiB container.
        assert_eq!(EXTENTFS_HEADER_LEN + EXTENTFS_DATA_LEN, 0x0010_0000);
    }
}
