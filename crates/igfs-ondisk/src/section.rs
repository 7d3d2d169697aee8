#![forbid(unsafe_code)]
//! Section header and the derived view of a section payload.

use crate::hash::HashBlock;
use crate::partition::PartitionBlock;
use igfs_types::{
    IGF_SECT_HDR_LEN, ParseError, SECTION_END_OF_CHAIN, SectionSize, ensure_slice, put_bytes,
    put_le_u16, put_le_u32, read_fixed, read_le_u16, read_le_u32,
};
use serde::{Deserialize, Serialize};

/// 32-byte header at the start of every data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHeader {
    /// CRC of the rest of the section.
    pub crc: u32,
    /// Magic number (erase count long ago); not validated.
    pub magic: u32,
    pub section_type: u16,
    /// `log2((section size in bytes) / 65536)`.
    pub section_size: u16,
    /// Partition number (driver minor number).
    pub partition_minor: u32,
    /// Update generation count.
    pub generation: u16,
    /// Index of this section within its partition, starting at 0.
    pub section_in_minor: u32,
    /// Next section of the chain, or `0xFFFF_FFFF` at the end.
    pub next_section: u32,
    pub reserved: [u8; 6],
}

impl SectionHeader {
    pub const SIZE: usize = IGF_SECT_HDR_LEN;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        Ok(Self {
            crc: read_le_u32(data, 0)?,
            magic: read_le_u32(data, 4)?,
            section_type: read_le_u16(data, 8)?,
            section_size: read_le_u16(data, 10)?,
            partition_minor: read_le_u32(data, 12)?,
            generation: read_le_u16(data, 16)?,
            section_in_minor: read_le_u32(data, 18)?,
            next_section: read_le_u32(data, 22)?,
            reserved: read_fixed::<6>(data, 26)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_le_u32(out, 0, self.crc)?;
        put_le_u32(out, 4, self.magic)?;
        put_le_u16(out, 8, self.section_type)?;
        put_le_u16(out, 10, self.section_size)?;
        put_le_u32(out, 12, self.partition_minor)?;
        put_le_u16(out, 16, self.generation)?;
        put_le_u32(out, 18, self.section_in_minor)?;
        put_le_u32(out, 22, self.next_section)?;
        put_bytes(out, 26, &self.reserved)?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }

    #[must_use]
    pub fn end_of_chain(&self) -> bool {
        self.next_section == SECTION_END_OF_CHAIN
    }

    #[must_use]
    pub fn declared_size(&self) -> Option<SectionSize> {
        SectionSize::from_exponent(self.section_size)
    }

    /// Header for a new section of the given partition.
    #[must_use]
    pub fn new(
        size: SectionSize,
        partition_minor: u32,
        section_in_minor: u32,
        next_section: u32,
    ) -> Self {
        Self {
            crc: igfs_types::CRC_DUMMY,
            magic: 0,
            section_type: 0,
            section_size: size.exponent(),
            partition_minor,
            generation: 1,
            section_in_minor,
            next_section,
            reserved: [0; 6],
        }
    }
}

/// A section split into header and raw payload bytes.
///
/// `payload` holds everything after the 32-byte header, including any
/// partition header, hash block and extent data. Use [`Section::derive`]
/// to re-parse the payload into those groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub header: SectionHeader,
    pub payload: Vec<u8>,
}

impl Section {
    /// Parse a full section; `bytes` must contain header plus payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let header = SectionHeader::parse(bytes)?;
        Ok(Self {
            header,
            payload: bytes[SectionHeader::SIZE..].to_vec(),
        })
    }

    /// Serialize back to the full section byte image.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; SectionHeader::SIZE + self.payload.len()];
        self.header
            .serialize_into(&mut out)
            .expect("buffer sized to model");
        out[SectionHeader::SIZE..].copy_from_slice(&self.payload);
        out
    }

    /// Re-parse the payload into partition header, hash block and payload
    /// offset. Best-effort: non-first sections yield no derived groups.
    #[must_use]
    pub fn derive(&self) -> DerivedSection {
        DerivedSection::parse(&self.payload)
    }
}

/// Derived view of a section payload.
///
/// Offsets are relative to the start of the payload (add
/// `SectionHeader::SIZE` for offsets within the full section).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DerivedSection {
    pub partition: Option<PartitionBlock>,
    pub hash: Option<HashBlock>,
    /// Where the section's data proper begins.
    pub payload_offset: usize,
}

impl DerivedSection {
    /// Derive the optional groups from a section payload.
    ///
    /// A partition block is recognised by a consistent `hdrlen` and a known
    /// partition type; a hash block by the `chksum` ident. Anything that
    /// does not parse leaves the corresponding group absent, as arbitrary
    /// payload bytes are expected on non-first sections.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Self {
        let mut derived = Self::default();

        let Ok(partition) = PartitionBlock::parse(payload) else {
            return derived;
        };
        derived.payload_offset = partition.size();

        if partition.header.has_hash_block() {
            if let Ok(hash) = HashBlock::parse_at(payload, derived.payload_offset) {
                derived.payload_offset = hash.end_offset();
                derived.hash = Some(hash);
            }
        }
        derived.partition = Some(partition);
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashExclude, HashHeader};
    use crate::partition::{PartitionExtent, PartitionHeader};
    use igfs_types::{
        HASH_HDR_IDENT, PARTITION_FLAG_HAS_IGEL_HASH, PartitionType, SECTION_END_OF_CHAIN,
        SIGNATURE_BYTE_SIZE,
    };

    fn sample_header() -> SectionHeader {
        SectionHeader {
            crc: 0xDEAD_BEEF,
            magic: 0,
            section_type: 0,
            section_size: SectionSize::S256K.exponent(),
            partition_minor: 1,
            generation: 2,
            section_in_minor: 0,
            next_section: 5,
            reserved: [0; 6],
        }
    }

    #[test]
    fn section_header_round_trip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), SectionHeader::SIZE);
        assert_eq!(SectionHeader::parse(&bytes).expect("parse"), header);
    }

    #[test]
    fn section_header_field_offsets() {
        // The exclude table relies on these exact offsets: crc at 0,
        // generation at 16, next_section at 22.
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), header.crc);
        assert_eq!(
            u16::from_le_bytes(bytes[16..18].try_into().unwrap()),
            header.generation
        );
        assert_eq!(
            u32::from_le_bytes(bytes[22..26].try_into().unwrap()),
            header.next_section
        );
    }

    #[test]
    fn section_round_trip() {
        let mut bytes = sample_header().to_bytes();
        bytes.extend_from_slice(&[0x5A_u8; 1000]);
        let section = Section::parse(&bytes).expect("parse");
        assert_eq!(section.to_bytes(), bytes);
        assert!(!section.header.end_of_chain());
    }

    #[test]
    fn end_of_chain_sentinel() {
        let header = SectionHeader::new(SectionSize::S256K, 1, 3, SECTION_END_OF_CHAIN);
        assert!(header.end_of_chain());
        assert_eq!(header.declared_size(), Some(SectionSize::S256K));
    }

    #[test]
    fn derive_plain_section_has_no_groups() {
        let derived = DerivedSection::parse(&[0_u8; 4096]);
        assert!(derived.partition.is_none());
        assert!(derived.hash.is_none());
        assert_eq!(derived.payload_offset, 0);
    }

    fn hash_header(count_hash: u64, count_excludes: u16) -> HashHeader {
        HashHeader {
            ident: *HASH_HDR_IDENT,
            version: 1,
            signature: [0; SIGNATURE_BYTE_SIZE],
            count_hash,
            signature_algo: 0,
            hash_algo: 1,
            hash_bytes: 64,
            blocksize: 0x40000,
            hash_header_size: (HashHeader::SIZE
                + usize::from(count_excludes) * HashExclude::SIZE)
                as u32,
            hash_block_size: 64 * u32::try_from(count_hash).unwrap(),
            count_excludes,
            excludes_size: HashExclude::SIZE as u16,
            offset_hash: 0,
            offset_hash_excludes: HashHeader::SIZE as u32,
            reserved: [0; 4],
        }
    }

    #[test]
    fn derive_first_section_with_partition_and_hash() {
        let mut part = PartitionHeader::new(
            PartitionType::IgelCompressed,
            PARTITION_FLAG_HAS_IGEL_HASH,
            1,
        );
        part.name[..3].copy_from_slice(b"sys");
        let extent = PartitionExtent {
            extent_type: 1,
            offset: 0,
            length: 100,
            name: *b"kernel\0\0",
        };

        let mut payload = part.to_bytes();
        payload.extend_from_slice(&extent.to_bytes());
        payload.extend_from_slice(&hash_header(2, 0).to_bytes());
        payload.extend_from_slice(&[0x11_u8; 128]); // two 64-byte digests
        payload.extend_from_slice(b"actual payload data");

        let derived = DerivedSection::parse(&payload);
        let partition = derived.partition.expect("partition block");
        assert_eq!(partition.header.name(), "sys");
        assert_eq!(partition.extents.len(), 1);
        let hash = derived.hash.expect("hash block");
        assert_eq!(hash.values.len(), 128);
        assert_eq!(
            derived.payload_offset,
            PartitionHeader::SIZE + PartitionExtent::SIZE + HashHeader::SIZE + 128
        );
        assert_eq!(&payload[derived.payload_offset..], b"actual payload data");
    }

    #[test]
    fn derive_without_hash_flag_skips_hash_block() {
        // A partition without the hash flag never yields a hash block, even
        // if the payload happens to start with the ident bytes.
        let part = PartitionHeader::new(PartitionType::IgelRaw, 0, 0);
        let mut payload = part.to_bytes();
        payload.extend_from_slice(b"chksum");
        payload.extend_from_slice(&[0_u8; 1024]);

        let derived = DerivedSection::parse(&payload);
        assert!(derived.partition.is_some());
        assert!(derived.hash.is_none());
        assert_eq!(derived.payload_offset, PartitionHeader::SIZE);
    }
}
