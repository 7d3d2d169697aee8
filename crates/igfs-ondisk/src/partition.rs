#![forbid(unsafe_code)]
//! Partition header and extent descriptors.

use igfs_types::{
    ExtentType, MAX_EXTENT_NUM, PARTITION_FLAG_HAS_CRYPT, PARTITION_FLAG_HAS_IGEL_HASH,
    PARTITION_FLAG_UPDATE_IN_PROGRESS, ParseError, PartitionType, ensure_slice, put_be_u16,
    put_bytes, put_le_u16, put_le_u32, put_le_u64, read_be_u16, read_fixed, read_le_u16,
    read_le_u32, read_le_u64, trim_nul_padded,
};

/// Partition header at the start of the first section of a partition.
///
/// The type field is stored big-endian, unlike the rest of the format:
/// low byte `PartitionType`, high bits `PARTITION_FLAG_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHeader {
    pub type_flags: u16,
    /// Length of the complete partition header (incl. extents).
    pub hdrlen: u16,
    /// Length of this partition (incl. header).
    pub partlen: u64,
    /// Number of uncompressed 1k blocks.
    pub n_blocks: u64,
    /// Needed for compressed partitions.
    pub offset_blocktable: u64,
    /// Start of the compressed block clusters.
    pub offset_blocks: u64,
    pub n_clusters: u32,
    /// 2^x blocks make up a cluster.
    pub cluster_shift: u16,
    pub n_extents: u16,
    pub name: [u8; 16],
    /// High-level hash over almost all files, used to decide whether an
    /// update is needed.
    pub update_hash: [u8; 64],
}

impl PartitionHeader {
    pub const SIZE: usize = 124;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        let header = Self {
            type_flags: read_be_u16(data, 0)?,
            hdrlen: read_le_u16(data, 2)?,
            partlen: read_le_u64(data, 4)?,
            n_blocks: read_le_u64(data, 12)?,
            offset_blocktable: read_le_u64(data, 20)?,
            offset_blocks: read_le_u64(data, 28)?,
            n_clusters: read_le_u32(data, 36)?,
            cluster_shift: read_le_u16(data, 40)?,
            n_extents: read_le_u16(data, 42)?,
            name: read_fixed::<16>(data, 44)?,
            update_hash: read_fixed::<64>(data, 60)?,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if usize::from(self.n_extents) > MAX_EXTENT_NUM {
            return Err(ParseError::InvalidField {
                field: "n_extents",
                reason: "exceeds extent table capacity",
            });
        }
        let expected = Self::SIZE + usize::from(self.n_extents) * PartitionExtent::SIZE;
        if usize::from(self.hdrlen) != expected {
            return Err(ParseError::InvalidField {
                field: "hdrlen",
                reason: "does not match header plus extent table size",
            });
        }
        if PartitionType::from_raw(self.type_byte()).is_none() {
            return Err(ParseError::InvalidField {
                field: "type",
                reason: "unknown partition type",
            });
        }
        Ok(())
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_be_u16(out, 0, self.type_flags)?;
        put_le_u16(out, 2, self.hdrlen)?;
        put_le_u64(out, 4, self.partlen)?;
        put_le_u64(out, 12, self.n_blocks)?;
        put_le_u64(out, 20, self.offset_blocktable)?;
        put_le_u64(out, 28, self.offset_blocks)?;
        put_le_u32(out, 36, self.n_clusters)?;
        put_le_u16(out, 40, self.cluster_shift)?;
        put_le_u16(out, 42, self.n_extents)?;
        put_bytes(out, 44, &self.name)?;
        put_bytes(out, 60, &self.update_hash)?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // low byte extraction
    fn type_byte(&self) -> u8 {
        (self.type_flags & 0xFF) as u8
    }

    /// Partition type from the low byte of the type field.
    pub fn partition_type(&self) -> Result<PartitionType, ParseError> {
        PartitionType::from_raw(self.type_byte()).ok_or(ParseError::InvalidField {
            field: "type",
            reason: "unknown partition type",
        })
    }

    #[must_use]
    pub fn has_hash_block(&self) -> bool {
        self.type_flags & PARTITION_FLAG_HAS_IGEL_HASH != 0
    }

    #[must_use]
    pub fn has_crypt(&self) -> bool {
        self.type_flags & PARTITION_FLAG_HAS_CRYPT != 0
    }

    #[must_use]
    pub fn update_in_progress(&self) -> bool {
        self.type_flags & PARTITION_FLAG_UPDATE_IN_PROGRESS != 0
    }

    #[must_use]
    pub fn name(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// New header for a partition with `n_extents` extent slots.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_EXTENT_NUM
    pub fn new(partition_type: PartitionType, flags: u16, n_extents: usize) -> Self {
        let n_extents = n_extents.min(MAX_EXTENT_NUM) as u16;
        Self {
            type_flags: u16::from(partition_type as u8) | flags,
            hdrlen: (Self::SIZE + usize::from(n_extents) * PartitionExtent::SIZE) as u16,
            partlen: 0,
            n_blocks: 0,
            offset_blocktable: 0,
            offset_blocks: 0,
            n_clusters: 0,
            cluster_shift: 0,
            n_extents,
            name: [0; 16],
            update_hash: [0; 64],
        }
    }
}

/// Fixed-size extent descriptor following the partition header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionExtent {
    pub extent_type: u16,
    /// Offset into the partition's concatenated payload stream.
    pub offset: u64,
    pub length: u64,
    pub name: [u8; 8],
}

impl PartitionExtent {
    pub const SIZE: usize = 26;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            extent_type: read_le_u16(data, 0)?,
            offset: read_le_u64(data, 2)?,
            length: read_le_u64(data, 10)?,
            name: read_fixed::<8>(data, 18)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_le_u16(out, 0, self.extent_type)?;
        put_le_u64(out, 2, self.offset)?;
        put_le_u64(out, 10, self.length)?;
        put_bytes(out, 18, &self.name)?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }

    #[must_use]
    pub fn get_type(&self) -> Option<ExtentType> {
        ExtentType::from_raw(self.extent_type)
    }

    #[must_use]
    pub fn name(&self) -> String {
        trim_nul_padded(&self.name)
    }
}

/// Partition header together with its extent table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBlock {
    pub header: PartitionHeader,
    pub extents: Vec<PartitionExtent>,
}

impl PartitionBlock {
    /// Parse header plus `n_extents` descriptors from the start of a
    /// section payload.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header = PartitionHeader::parse(data)?;
        let mut extents = Vec::with_capacity(usize::from(header.n_extents));
        let mut offset = PartitionHeader::SIZE;
        for _ in 0..header.n_extents {
            extents.push(PartitionExtent::parse(ensure_slice(
                data,
                offset,
                PartitionExtent::SIZE,
            )?)?);
            offset += PartitionExtent::SIZE;
        }
        Ok(Self { header, extents })
    }

    /// Total serialized size (`hdrlen`).
    #[must_use]
    pub fn size(&self) -> usize {
        usize::from(self.header.hdrlen)
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        self.header.serialize_into(out)?;
        let mut offset = PartitionHeader::SIZE;
        for extent in &self.extents {
            extent.serialize_into(&mut out[offset..offset + PartitionExtent::SIZE])?;
            offset += PartitionExtent::SIZE;
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; self.size()];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use igfs_types::PARTITION_FLAG_HAS_IGEL_HASH;

    fn sample_header(n_extents: u16) -> PartitionHeader {
        let mut header = PartitionHeader::new(
            PartitionType::IgelCompressed,
            PARTITION_FLAG_HAS_IGEL_HASH,
            usize::from(n_extents),
        );
        header.partlen = 0x0010_0000;
        header.n_blocks = 1024;
        header.name[..3].copy_from_slice(b"sys");
        header
    }

    #[test]
    fn partition_header_round_trip() {
        let header = sample_header(0);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), PartitionHeader::SIZE);
        let parsed = PartitionHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed, header);
        assert_eq!(parsed.name(), "sys");
        assert!(parsed.has_hash_block());
        assert!(!parsed.has_crypt());
    }

    #[test]
    fn partition_type_field_is_big_endian() {
        let header = sample_header(0);
        let bytes = header.to_bytes();
        // Flags land in the first byte, the type in the second.
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[1], PartitionType::IgelCompressed as u8);
    }

    #[test]
    fn partition_header_rejects_bad_hdrlen() {
        let mut bytes = sample_header(0).to_bytes();
        bytes[2] = 0xFF;
        bytes[3] = 0xFF;
        assert!(PartitionHeader::parse(&bytes).is_err());
    }

    #[test]
    fn partition_header_rejects_unknown_type() {
        let mut bytes = sample_header(0).to_bytes();
        bytes[1] = 0x99;
        assert!(PartitionHeader::parse(&bytes).is_err());
    }

    #[test]
    fn partition_block_round_trip_with_extents() {
        let header = sample_header(2);
        let extents = vec![
            PartitionExtent {
                extent_type: ExtentType::Kernel as u16,
                offset: 0,
                length: 4096,
                name: *b"kernel\0\0",
            },
            PartitionExtent {
                extent_type: ExtentType::Splash as u16,
                offset: 4096,
                length: 512,
                name: *b"splash\0\0",
            },
        ];
        let block = PartitionBlock { header, extents };
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), PartitionHeader::SIZE + 2 * PartitionExtent::SIZE);
        let parsed = PartitionBlock::parse(&bytes).expect("parse");
        assert_eq!(parsed, block);
        assert_eq!(parsed.extents[0].get_type(), Some(ExtentType::Kernel));
        assert_eq!(parsed.extents[1].name(), "splash");
    }

    #[test]
    fn truncated_extent_table_fails() {
        let header = sample_header(1);
        let bytes = header.to_bytes();
        // Header only, missing the declared extent descriptor.
        assert!(PartitionBlock::parse(&bytes).is_err());
    }
}
