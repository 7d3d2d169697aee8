#![forbid(unsafe_code)]
//! Hash block: header, exclude table and digest values.
//!
//! A signed partition carries a hash block right after its partition header:
//! one BLAKE2b digest per section, an RSA signature over the digests and the
//! exclude table, and the exclude table itself marking byte ranges that must
//! read as zero while hashing (CRC, generation, next pointer, the signature
//! and the digests themselves).

use igfs_types::{
    HASH_HDR_IDENT, ParseError, SIGNATURE_BYTE_SIZE, ensure_slice, put_bytes, put_le_u16,
    put_le_u32, put_le_u64, put_u8, read_fixed, read_le_u16, read_le_u32, read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};

/// Exclude record; addresses are absolute image byte offsets.
///
/// A non-zero `repeat` re-applies the range every `repeat` bytes until
/// `end`, which is how per-section fields (CRC, generation, next pointer)
/// are excluded across a whole partition with a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashExclude {
    pub start: u64,
    pub size: u32,
    pub repeat: u32,
    pub end: u64,
}

impl HashExclude {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            start: read_le_u64(data, 0)?,
            size: read_le_u32(data, 8)?,
            repeat: read_le_u32(data, 12)?,
            end: read_le_u64(data, 16)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_le_u64(out, 0, self.start)?;
        put_le_u32(out, 8, self.size)?;
        put_le_u32(out, 12, self.repeat)?;
        put_le_u64(out, 16, self.end)?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }
}

/// Header of the per-partition hash block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashHeader {
    pub ident: [u8; 6],
    pub version: u16,
    /// RSA-4096 signature over SHA-256 of `hash_values || excludes`.
    pub signature: [u8; SIGNATURE_BYTE_SIZE],
    /// Count of hash values (one per section of the partition).
    pub count_hash: u64,
    pub signature_algo: u8,
    pub hash_algo: u8,
    /// Digest length in bytes (BLAKE2b output length).
    pub hash_bytes: u16,
    /// Size of data used for hashing.
    pub blocksize: u32,
    /// Size of the hash header including excludes.
    pub hash_header_size: u32,
    /// Size of the hash values block (`hash_bytes * count_hash`).
    pub hash_block_size: u32,
    pub count_excludes: u16,
    /// Size of one exclude record in bytes.
    pub excludes_size: u16,
    /// Offset of the hash values from the section header, in bytes.
    pub offset_hash: u32,
    /// Offset of the exclude table from the start of this header.
    pub offset_hash_excludes: u32,
    pub reserved: [u8; 4],
}

impl HashHeader {
    pub const SIZE: usize = 560;
    /// Offset of the signature field within the header.
    pub const SIGNATURE_OFFSET: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        let header = Self {
            ident: read_fixed::<6>(data, 0)?,
            version: read_le_u16(data, 6)?,
            signature: read_fixed::<SIGNATURE_BYTE_SIZE>(data, 8)?,
            count_hash: read_le_u64(data, 520)?,
            signature_algo: read_u8(data, 528)?,
            hash_algo: read_u8(data, 529)?,
            hash_bytes: read_le_u16(data, 530)?,
            blocksize: read_le_u32(data, 532)?,
            hash_header_size: read_le_u32(data, 536)?,
            hash_block_size: read_le_u32(data, 540)?,
            count_excludes: read_le_u16(data, 544)?,
            excludes_size: read_le_u16(data, 546)?,
            offset_hash: read_le_u32(data, 548)?,
            offset_hash_excludes: read_le_u32(data, 552)?,
            reserved: read_fixed::<4>(data, 556)?,
        };
        if header.ident != *HASH_HDR_IDENT {
            return Err(ParseError::InvalidMagic {
                context: "hash header",
            });
        }
        if u64::from(header.hash_block_size) != u64::from(header.hash_bytes) * header.count_hash {
            return Err(ParseError::InvalidField {
                field: "hash_block_size",
                reason: "does not equal hash_bytes * count_hash",
            });
        }
        Ok(header)
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_bytes(out, 0, &self.ident)?;
        put_le_u16(out, 6, self.version)?;
        put_bytes(out, 8, &self.signature)?;
        put_le_u64(out, 520, self.count_hash)?;
        put_u8(out, 528, self.signature_algo)?;
        put_u8(out, 529, self.hash_algo)?;
        put_le_u16(out, 530, self.hash_bytes)?;
        put_le_u32(out, 532, self.blocksize)?;
        put_le_u32(out, 536, self.hash_header_size)?;
        put_le_u32(out, 540, self.hash_block_size)?;
        put_le_u16(out, 544, self.count_excludes)?;
        put_le_u16(out, 546, self.excludes_size)?;
        put_le_u32(out, 548, self.offset_hash)?;
        put_le_u32(out, 552, self.offset_hash_excludes)?;
        put_bytes(out, 556, &self.reserved)?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }
}

/// Complete hash block as laid out on disk, with payload-relative offsets
/// so the write pipeline can patch the signature and digests in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashBlock {
    pub header: HashHeader,
    pub excludes: Vec<HashExclude>,
    /// Concatenated digests, `hash_bytes` each.
    pub values: Vec<u8>,
    /// Offset of the header relative to the start of the section payload.
    pub header_offset: usize,
}

impl HashBlock {
    /// Parse a hash block at `offset` within a section payload.
    pub fn parse_at(payload: &[u8], offset: usize) -> Result<Self, ParseError> {
        let header = HashHeader::parse(ensure_slice(payload, offset, HashHeader::SIZE)?)?;
        let mut cursor = offset + HashHeader::SIZE;
        let mut excludes = Vec::with_capacity(usize::from(header.count_excludes));
        for _ in 0..header.count_excludes {
            excludes.push(HashExclude::parse(ensure_slice(
                payload,
                cursor,
                HashExclude::SIZE,
            )?)?);
            cursor += HashExclude::SIZE;
        }
        let values_len = igfs_types::u64_to_usize(u64::from(header.hash_block_size), "hash_block_size")?;
        let values = ensure_slice(payload, cursor, values_len)?.to_vec();
        Ok(Self {
            header,
            excludes,
            values,
            header_offset: offset,
        })
    }

    /// Offset of the signature field relative to the section payload.
    #[must_use]
    pub fn signature_offset(&self) -> usize {
        self.header_offset + HashHeader::SIGNATURE_OFFSET
    }

    /// Offset of the exclude table relative to the section payload.
    #[must_use]
    pub fn excludes_offset(&self) -> usize {
        self.header_offset + HashHeader::SIZE
    }

    /// Offset of the digest values relative to the section payload.
    #[must_use]
    pub fn values_offset(&self) -> usize {
        self.excludes_offset() + self.excludes.len() * HashExclude::SIZE
    }

    /// End of the hash block relative to the section payload.
    #[must_use]
    pub fn end_offset(&self) -> usize {
        self.values_offset() + self.values.len()
    }

    /// Digest for the section with the given index in its partition.
    #[must_use]
    pub fn value_for(&self, section_in_minor: usize) -> Option<&[u8]> {
        let width = usize::from(self.header.hash_bytes);
        let start = section_in_minor.checked_mul(width)?;
        self.values.get(start..start + width)
    }

    /// Serialized exclude table, as covered by the signature.
    #[must_use]
    pub fn excludes_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.excludes.len() * HashExclude::SIZE);
        for exclude in &self.excludes {
            out.extend_from_slice(&exclude.to_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use igfs_types::HASH_SIGNATURE_TYPE_NONE;

    fn sample_header(count_hash: u64, count_excludes: u16) -> HashHeader {
        HashHeader {
            ident: *HASH_HDR_IDENT,
            version: 1,
            signature: [0; SIGNATURE_BYTE_SIZE],
            count_hash,
            signature_algo: HASH_SIGNATURE_TYPE_NONE,
            hash_algo: 1,
            hash_bytes: 64,
            blocksize: 0x40000,
            hash_header_size: (HashHeader::SIZE
                + usize::from(count_excludes) * HashExclude::SIZE) as u32,
            hash_block_size: 64 * u32::try_from(count_hash).unwrap(),
            count_excludes,
            excludes_size: HashExclude::SIZE as u16,
            offset_hash: 0,
            offset_hash_excludes: HashHeader::SIZE as u32,
            reserved: [0; 4],
        }
    }

    #[test]
    fn hash_header_round_trip() {
        let header = sample_header(3, 5);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HashHeader::SIZE);
        assert_eq!(HashHeader::parse(&bytes).expect("parse"), header);
    }

    #[test]
    fn hash_header_rejects_bad_ident() {
        let mut bytes = sample_header(1, 0).to_bytes();
        bytes[0] = b'x';
        assert_eq!(
            HashHeader::parse(&bytes),
            Err(ParseError::InvalidMagic {
                context: "hash header"
            })
        );
    }

    #[test]
    fn hash_header_rejects_inconsistent_block_size() {
        let mut header = sample_header(2, 0);
        header.hash_block_size = 65;
        let bytes = header.to_bytes();
        assert!(HashHeader::parse(&bytes).is_err());
    }

    #[test]
    fn hash_exclude_round_trip() {
        let exclude = HashExclude {
            start: 0x40000,
            size: 4,
            repeat: 0x40000,
            end: 0x100000,
        };
        let bytes = exclude.to_bytes();
        assert_eq!(bytes.len(), HashExclude::SIZE);
        assert_eq!(HashExclude::parse(&bytes).expect("parse"), exclude);
    }

    #[test]
    fn hash_block_parse_and_offsets() {
        let header = sample_header(2, 1);
        let exclude = HashExclude {
            start: 0,
            size: 4,
            repeat: 0x40000,
            end: 0x80000,
        };
        let mut payload = header.to_bytes();
        payload.extend_from_slice(&exclude.to_bytes());
        payload.extend_from_slice(&[0xAB_u8; 128]);
        payload.extend_from_slice(b"trailing payload");

        let block = HashBlock::parse_at(&payload, 0).expect("parse");
        assert_eq!(block.excludes, vec![exclude]);
        assert_eq!(block.values.len(), 128);
        assert_eq!(block.signature_offset(), HashHeader::SIGNATURE_OFFSET);
        assert_eq!(block.excludes_offset(), HashHeader::SIZE);
        assert_eq!(block.values_offset(), HashHeader::SIZE + HashExclude::SIZE);
        assert_eq!(block.end_offset(), HashHeader::SIZE + HashExclude::SIZE + 128);
        assert_eq!(block.value_for(1), Some(&[0xAB_u8; 64][..]));
        assert_eq!(block.value_for(2), None);
        assert_eq!(block.excludes_bytes(), exclude.to_bytes());
    }

    #[test]
    fn hash_block_truncated_values_fails() {
        let header = sample_header(2, 0);
        let mut payload = header.to_bytes();
        payload.extend_from_slice(&[0_u8; 64]); // only one digest of two
        assert!(HashBlock::parse_at(&payload, 0).is_err());
    }
}
